use std::collections::BTreeMap;

use mculink_dict::MessageKind;
use serde::Serialize;
use serde_json::Value;

use crate::cmd::InfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{key_value_table, print_json, OutputFormat};

#[derive(Serialize, Default)]
struct MessageCounts {
    commands: usize,
    responses: usize,
    output: usize,
}

#[derive(Serialize)]
struct InfoOutput {
    schema_id: &'static str,
    mcu: String,
    device: String,
    version: String,
    build_versions: String,
    clock_freq: f64,
    constants: BTreeMap<String, Value>,
    messages: MessageCounts,
    stats: String,
}

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let mcu = args.device.connect()?;
    let dict = mcu.dictionary();

    let mut messages = MessageCounts::default();
    for (_, kind, _) in dict.messages() {
        match kind {
            MessageKind::Command => messages.commands += 1,
            MessageKind::Response => messages.responses += 1,
            MessageKind::Output => messages.output += 1,
        }
    }

    let out = InfoOutput {
        schema_id: "https://schemas.3leaps.dev/mculink/cli/v1/mcu-info.schema.json",
        mcu: mcu.name().to_string(),
        device: args.device.device.clone(),
        version: dict.version().to_string(),
        build_versions: dict.build_versions().to_string(),
        clock_freq: mcu.mcu_freq(),
        constants: dict.constants().clone(),
        messages,
        stats: mcu.stats(),
    };
    mcu.disconnect();

    print_info(&out, format);
    Ok(SUCCESS)
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let rows = [
                ("mcu", out.mcu.clone()),
                ("device", out.device.clone()),
                ("version", out.version.clone()),
                ("build versions", out.build_versions.clone()),
                ("clock freq", format!("{}", out.clock_freq)),
                ("commands", out.messages.commands.to_string()),
                ("responses", out.messages.responses.to_string()),
                ("output", out.messages.output.to_string()),
            ];
            let table = key_value_table(
                ["FIELD", "VALUE"],
                rows.into_iter().map(|(k, v)| (k.to_string(), v)),
            );
            println!("{table}");

            let constants = key_value_table(
                ["CONSTANT", "VALUE"],
                out.constants
                    .iter()
                    .map(|(k, v)| (k.clone(), constant_text(v))),
            );
            println!("{constants}");
        }
        OutputFormat::Pretty => {
            println!("MCU '{}' on {}:", out.mcu, out.device);
            println!("  Version:        {}", out.version);
            println!("  Build versions: {}", out.build_versions);
            println!("  Clock freq:     {}", out.clock_freq);
            println!(
                "  Messages:       {} commands, {} responses, {} output",
                out.messages.commands, out.messages.responses, out.messages.output
            );
            println!("  Constants:");
            for (name, value) in &out.constants {
                println!("    {name} = {}", constant_text(value));
            }
            println!("  Stats:          {}", out.stats);
        }
    }
}

fn constant_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
