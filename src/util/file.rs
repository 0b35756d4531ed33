use tokio::{fs::File, io::AsyncReadExt};
use std::collections::HashMap;

const COMMENT_CHAR: char = '#';
const EQUALS_CHAR: char = '=';

pub fn parse_properties(props_raw: &str) -> HashMap<String, String> {
    props_raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_CHAR))
        // split once: values such as connection uris may contain '='
        .filter_map(|line| line.split_once(EQUALS_CHAR))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

pub async fn deserialize_properties_file(file_path: &str) -> Result<HashMap<String, String>, std::io::Error> {
    let props_raw = read_file(file_path).await?;
    Ok(parse_properties(&props_raw))
}

pub async fn read_file(file_path: &str) -> Result<String, std::io::Error> {
    let mut file = File::open(file_path).await?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).await?;
    Ok(contents)
}
