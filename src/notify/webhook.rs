use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use url::Url;

use crate::{
    flag::{Diff, Flag},
    Error, Result,
};

use super::Notifier;

const COLOR_DELETED: &str = "#FF0000";
const COLOR_ADDED: &str = "#008000";
const COLOR_UPDATED: &str = "#FFA500";

/// Posts changes to a chat webhook (Slack incoming webhook format).
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

#[derive(Debug, Serialize)]
struct Message {
    text: String,
    attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
struct Attachment {
    color: &'static str,
    title: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<Field>,
}

#[derive(Debug, PartialEq, Serialize)]
struct Field {
    title: String,
    value: String,
    short: bool,
}

impl WebhookNotifier {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(url: &str) -> Result<WebhookNotifier> {
        if url.is_empty() {
            return Err(Error::InvalidConfiguration(
                "webhook notifier requires a url".to_owned(),
            ));
        }
        let url = Url::parse(url).map_err(Error::InvalidUrl)?;
        let client = Client::builder()
            .timeout(WebhookNotifier::REQUEST_TIMEOUT)
            .build()?;
        Ok(WebhookNotifier { client, url })
    }

    fn message(diff: &Diff) -> Message {
        let deleted = diff.deleted.keys().map(|key| Attachment {
            color: COLOR_DELETED,
            title: format!("Flag \"{key}\" deleted"),
            fields: Vec::new(),
        });
        let added = diff.added.keys().map(|key| Attachment {
            color: COLOR_ADDED,
            title: format!("Flag \"{key}\" added"),
            fields: Vec::new(),
        });
        let updated = diff.updated.iter().map(|(key, change)| Attachment {
            color: COLOR_UPDATED,
            title: format!("Flag \"{key}\" updated"),
            fields: changes(&change.before, &change.after),
        });

        Message {
            text: "Changes detected in feature flags".to_owned(),
            attachments: deleted.chain(added).chain(updated).collect(),
        }
    }
}

fn render<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn change(title: String, before: String, after: String) -> Field {
    Field {
        title,
        value: format!("{before} => {after}"),
        short: false,
    }
}

/// Field-level differences between two versions of a flag.
fn changes(before: &Flag, after: &Flag) -> Vec<Field> {
    let mut fields = Vec::new();

    if before.disabled != after.disabled {
        fields.push(change(
            "disabled".to_owned(),
            render(&before.disabled),
            render(&after.disabled),
        ));
    }

    let mut variants: Vec<&String> = before.variants.keys().chain(after.variants.keys()).collect();
    variants.sort();
    variants.dedup();
    for name in variants {
        let (old, new) = (before.variants.get(name), after.variants.get(name));
        if old != new {
            fields.push(change(format!("variants.{name}"), render(&old), render(&new)));
        }
    }

    for index in 0..before.rules.len().max(after.rules.len()) {
        let (old, new) = (before.rules.get(index), after.rules.get(index));
        if old != new {
            fields.push(change(format!("rules.{index}"), render(&old), render(&new)));
        }
    }

    fields
}

impl Notifier for WebhookNotifier {
    fn notify(&self, diff: &Diff) -> Result<()> {
        let message = WebhookNotifier::message(diff);
        let response = self.client.post(self.url.clone()).json(&message).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus(status));
        }
        Ok(())
    }
}
