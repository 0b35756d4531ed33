use anyhow::anyhow;
use serde::Serialize;

use crate::database::models::punishment::Punishment;

/// Discord-style notifications for punishment activity.
pub struct WebhookUtils {
    pub punishments_webhook_client: Option<WebhookClient>
}

impl WebhookUtils {
    const COLOR_NEW_PUNISHMENT: u32 = 0x0077FF;
    const COLOR_PUNISHMENT_LIFTED: u32 = 0x00FF4C;

    pub fn new(punishments_webhook_url: &Option<String>) -> Self {
        Self {
            punishments_webhook_client: punishments_webhook_url.as_ref().map(|url| {
                WebhookClient { url: url.to_owned(), client: reqwest::Client::new() }
            })
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.punishments_webhook_client.is_some()
    }

    pub async fn send_punishment_webhook(&self, punishment: &Punishment) {
        if let Some(punishments_client) = &self.punishments_webhook_client {
            let mut message = WebhookMessage::default();
            message.add_embed(Self::new_punishment_embed(punishment));
            if let Err(e) = punishments_client.send(&message).await {
                warn!("Punishment webhook rejected: {}", e);
            }
        }
    }

    pub async fn send_punishment_lifted_webhook(&self, punishment: &Punishment) {
        if let Some(punishments_client) = &self.punishments_webhook_client {
            let mut message = WebhookMessage::default();
            message.add_embed(Self::lifted_punishment_embed(punishment));
            if let Err(e) = punishments_client.send(&message).await {
                warn!("Punishment webhook rejected: {}", e);
            }
        }
    }

    fn new_punishment_embed(punishment: &Punishment) -> DiscordEmbed {
        let mut embed = DiscordEmbed::default();
        embed
            .color(Self::COLOR_NEW_PUNISHMENT)
            .title(String::from("New punishment"))
            .timestamp(punishment.created_at.to_rfc3339())
            .footer(DiscordEmbedFooter {
                text: format!("Pun ID: {}", punishment.id),
                icon_url: None
            })
            .add_field(DiscordEmbedField {
                name: String::from("Target"),
                value: escape_markdown(&punishment.target_id),
                inline: true
            })
            .add_field(DiscordEmbedField {
                name: String::from("Staff"),
                value: issuer_name(punishment),
                inline: true
            })
            .add_field(DiscordEmbedField {
                name: String::from("Type"),
                value: punishment.kind.to_string(),
                inline: true
            })
            .add_field(DiscordEmbedField {
                name: String::from("Duration"),
                value: punishment.formatted_duration(),
                inline: true
            })
            .add_field(DiscordEmbedField {
                name: String::from("Reason"),
                value: escape_markdown(&punishment.reason),
                inline: false
            });
        embed
    }

    fn lifted_punishment_embed(punishment: &Punishment) -> DiscordEmbed {
        let mut embed = DiscordEmbed::default();
        embed
            .color(Self::COLOR_PUNISHMENT_LIFTED)
            .title(String::from("Punishment lifted"))
            .footer(DiscordEmbedFooter {
                text: format!("Pun ID: {}", punishment.id),
                icon_url: None
            })
            .add_field(DiscordEmbedField {
                name: String::from("Target"),
                value: escape_markdown(&punishment.target_id),
                inline: true
            })
            .add_field(DiscordEmbedField {
                name: String::from("Punishment"),
                value: format!("{} - {}", punishment.kind, escape_markdown(&punishment.reason)),
                inline: false
            });
        embed
    }
}

fn issuer_name(punishment: &Punishment) -> String {
    if punishment.is_console_issued() {
        return String::from("Console");
    }
    escape_markdown(punishment.issuer_id.as_deref().unwrap_or_default())
}

fn escape_markdown(s: &str) -> String {
    s.replace('*', "\\*")
        .replace('/', "\\/")
        .replace('(', "\\(")
        .replace(')', "\\)")
        .replace('[', "\\[")
        .replace(']', "\\]")
        .replace('_', "\\_")
}

pub struct WebhookClient {
    pub url: String,
    pub client: reqwest::Client
}

impl WebhookClient {
    pub async fn send(&self, message: &WebhookMessage) -> anyhow::Result<()> {
        if message.embeds.is_empty() {
            return Err(anyhow!("refusing to send a webhook message without embeds"));
        }
        match self.client.post(&self.url)
            .json(message)
            .send()
            .await {
                Err(e) => {
                    warn!("Webhook failed: {}", e);
                },
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(anyhow!("webhook responded with {}", response.status()));
                    }
                }
        };
        Ok(())
    }
}

#[derive(Serialize, Default)]
pub struct WebhookMessage {
    tts: bool,
    embeds: Vec<DiscordEmbed>
}

impl WebhookMessage {
    pub fn add_embed(&mut self, embed: DiscordEmbed) -> &mut Self {
        self.embeds.push(embed);
        self
    }
}

#[derive(Serialize)]
pub struct DiscordEmbed {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(rename = "type")]
    embed_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<DiscordEmbedFooter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<DiscordEmbedField>
}

impl Default for DiscordEmbed {
    fn default() -> Self {
        Self {
            title: None,
            embed_type: String::from("rich"),
            timestamp: None,
            color: None,
            footer: None,
            fields: Vec::new()
        }
    }
}

impl DiscordEmbed {
    pub fn title(&mut self, title: String) -> &mut Self {
        self.title = Some(title);
        self
    }

    pub fn timestamp(&mut self, timestamp: String) -> &mut Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn color(&mut self, color: u32) -> &mut Self {
        self.color = Some(color);
        self
    }

    pub fn footer(&mut self, footer: DiscordEmbedFooter) -> &mut Self {
        self.footer = Some(footer);
        self
    }

    pub fn add_field(&mut self, field: DiscordEmbedField) -> &mut Self {
        self.fields.push(field);
        self
    }
}

#[derive(Serialize)]
pub struct DiscordEmbedFooter {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>
}

#[derive(Serialize)]
pub struct DiscordEmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool
}
