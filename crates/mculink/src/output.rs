use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use mculink_dict::{MessageDictionary, MessageParams};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    schema_id: &'a str,
    mcu: &'a str,
    name: &'a str,
    text: String,
    params: &'a MessageParams,
    timestamp: String,
}

/// Print one decoded MCU message.
pub fn print_message(
    params: &MessageParams,
    dict: &MessageDictionary,
    mcu: &str,
    format: OutputFormat,
) {
    let text = dict.format_params(params);
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                schema_id: "https://schemas.3leaps.dev/mculink/cli/v1/message-received.schema.json",
                mcu,
                name: params.name(),
                text,
                params,
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["MCU", "RECEIVED", "MESSAGE"])
                .add_row(vec![
                    mcu.to_string(),
                    format!("{:.3}", params.receive_time()),
                    text,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("{mcu} {:.3}: {text}", params.receive_time());
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn key_value_table(header: [&str; 2], rows: impl IntoIterator<Item = (String, String)>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    for (key, value) in rows {
        table.add_row(vec![key, value]);
    }
    table
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
