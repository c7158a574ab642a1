use mculink_dict::MessageDictionary;
use tracing::{debug, info};

use crate::config::IdentifyConfig;
use crate::error::{McuError, Result};
use crate::handler::SerialHandler;

/// Download the firmware's compressed dictionary in chunks.
///
/// Each `identify` request asks for the bytes at the current offset; a reply
/// for any other offset is stale and the request is repeated. An empty chunk
/// ends the transfer.
pub fn download_identify_data(handler: &SerialHandler, config: &IdentifyConfig) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut mismatches = 0;
    loop {
        let text = format!("identify offset={} count={}", data.len(), config.chunk_size);
        let params = handler.send_with_response(&text, "identify_response", None)?;
        let offset = params.get_u32("offset").ok_or_else(|| missing(handler, "offset"))?;
        if offset as usize != data.len() {
            mismatches += 1;
            debug!(mcu = handler.name(), offset, expected = data.len(), "stale identify chunk");
            if mismatches > config.max_offset_mismatches {
                return Err(McuError::Identify {
                    mcu: handler.name().to_string(),
                    reason: format!("offset {offset} repeatedly does not match {}", data.len()),
                });
            }
            continue;
        }
        let chunk = params.get_bytes("data").ok_or_else(|| missing(handler, "data"))?;
        if chunk.is_empty() {
            return Ok(data);
        }
        data.extend_from_slice(chunk);
    }
}

fn missing(handler: &SerialHandler, field: &str) -> McuError {
    McuError::MissingField {
        mcu: handler.name().to_string(),
        message: "identify_response".to_string(),
        field: field.to_string(),
    }
}

/// Run the identify handshake and install the resulting dictionary.
///
/// Also applies the link parameters the firmware advertises: `SERIAL_BAUD`
/// for wire-time estimates and `RECEIVE_WINDOW` for flow control.
pub fn identify(handler: &SerialHandler, config: &IdentifyConfig) -> Result<()> {
    let data = download_identify_data(handler, config)?;
    let dict = MessageDictionary::from_identify(&data).map_err(|err| McuError::Identify {
        mcu: handler.name().to_string(),
        reason: err.to_string(),
    })?;
    info!(
        mcu = handler.name(),
        version = dict.version(),
        build = dict.build_versions(),
        bytes = data.len(),
        "loaded mcu data dictionary"
    );

    if let Ok(baud) = dict.get_constant_float("SERIAL_BAUD") {
        handler.queue().set_wire_frequency(baud);
    }
    if let Ok(window) = dict.get_constant_int("RECEIVE_WINDOW") {
        if let Ok(window) = usize::try_from(window) {
            handler.queue().set_receive_window(window);
        }
    }
    handler.install_dictionary(dict);
    Ok(())
}
