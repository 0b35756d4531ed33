use sha2::{Sha256, Digest};

pub fn sha256_hash_formatted(digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(digest.as_bytes());
    hasher.finalize().iter().fold(String::new(), |mut hex_str, elem| {
        hex_str.push_str(&format!("{:02x}", elem));
        hex_str
    })
}

pub fn hash_ip(enable_ip_hashing: bool, ip: &str) -> String {
    let ip = ip.trim();
    if enable_ip_hashing { sha256_hash_formatted(ip) }
    else { ip.to_owned() }
}
