use serde::Serialize;

use crate::cmd::SendArgs;
use crate::exit::{mcu_error, CliResult, SUCCESS};
use crate::output::{print_json, print_message, OutputFormat};

#[derive(Serialize)]
struct AckOutput<'a> {
    schema_id: &'static str,
    mcu: &'a str,
    command: &'a str,
    acked: bool,
    ack_time: f64,
}

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let mcu = args.device.connect()?;
    let text = args.command_text();
    let handler = mcu.handler();

    match &args.response {
        Some(response) => {
            let params = mcu
                .send_with_response(&text, response)
                .map_err(|err| mcu_error("send failed", err))?;
            print_message(&params, &mcu.dictionary(), mcu.name(), format);
        }
        None => {
            let cmd = handler
                .create_command(&text)
                .map_err(|err| mcu_error("send failed", err))?;
            let ack_time = handler
                .raw_send_wait_ack(cmd, 0, 0, handler.default_queue())
                .map_err(|err| mcu_error("send failed", err))?;
            let out = AckOutput {
                schema_id: "https://schemas.3leaps.dev/mculink/cli/v1/command-acked.schema.json",
                mcu: mcu.name(),
                command: &text,
                acked: true,
                ack_time,
            };
            match format {
                OutputFormat::Json => print_json(&out),
                OutputFormat::Table | OutputFormat::Pretty => {
                    println!("{}: '{}' acked at {:.3}", out.mcu, out.command, out.ack_time);
                }
            }
        }
    }

    mcu.disconnect();
    Ok(SUCCESS)
}
