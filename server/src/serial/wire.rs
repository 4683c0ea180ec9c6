//! Wire-level framing for the EBB's ASCII protocol (spec.md §6).
//!
//! Commands are CR-terminated, case-insensitive, and at most 256 bytes
//! including the terminator. Responses are CRLF-terminated. The device's
//! default "legacy" framing appends an `OK\r\n` trailer to commands and to
//! a subset of queries; the driver tolerates both legacy and "future"
//! (no-trailer) framings by only requiring the trailer for command
//! envelopes and query-with-terminator envelopes.

use ebb_protocol::ControlError;

use super::envelope::{CommandKind, EnvelopeResponse};

pub const MAX_COMMAND_LEN: usize = 256;

/// Encode a command for transmission: append the CR terminator, validate
/// the total length.
pub fn encode(text: &str) -> Result<Vec<u8>, ControlError> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(b'\r');
    if bytes.len() > MAX_COMMAND_LEN {
        return Err(ControlError::validation(format!(
            "command exceeds {MAX_COMMAND_LEN} bytes including terminator"
        )));
    }
    Ok(bytes)
}

/// True if `line` is a device error line: begins with `!` or contains
/// `Err:` (case-insensitive, per spec.md §6).
pub fn is_error_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('!') || trimmed.to_lowercase().contains("err:")
}

/// Assemble the `EnvelopeResponse` for a completed exchange, given the
/// lines read off the wire (already trimmed of CRLF, blank lines
/// filtered) and the envelope's classification. Returns `DeviceError` if
/// any consumed line reports an error.
pub fn assemble_response(
    kind: CommandKind,
    lines: &[String],
) -> Result<EnvelopeResponse, ControlError> {
    match kind {
        CommandKind::Command => {
            let term = lines.first().ok_or(ControlError::Timeout)?;
            if is_error_line(term) {
                return Err(ControlError::device_error(term.clone()));
            }
            Ok(EnvelopeResponse { data_line: None })
        }
        CommandKind::QueryWithoutTerminator => {
            let data = lines.first().ok_or(ControlError::Timeout)?;
            if is_error_line(data) {
                return Err(ControlError::device_error(data.clone()));
            }
            Ok(EnvelopeResponse { data_line: Some(data.clone()) })
        }
        CommandKind::QueryWithTerminator => {
            let data = lines.first().ok_or(ControlError::Timeout)?;
            if is_error_line(data) {
                return Err(ControlError::device_error(data.clone()));
            }
            let term = lines.get(1).ok_or(ControlError::Timeout)?;
            if is_error_line(term) {
                return Err(ControlError::device_error(term.clone()));
            }
            Ok(EnvelopeResponse { data_line: Some(data.clone()) })
        }
    }
}

/// How many non-blank lines a given command kind needs read off the wire
/// before `assemble_response` can be called.
pub fn lines_needed(kind: CommandKind) -> usize {
    match kind {
        CommandKind::Command | CommandKind::QueryWithoutTerminator => 1,
        CommandKind::QueryWithTerminator => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_appends_cr_and_checks_length() {
        let bytes = encode("V").unwrap();
        assert_eq!(bytes, b"V\r");

        let too_long = "X".repeat(300);
        assert!(encode(&too_long).is_err());
    }

    #[test]
    fn error_line_detection() {
        assert!(is_error_line("!0 Err: Unknown Command"));
        assert!(is_error_line("Err: bad parameter"));
        assert!(!is_error_line("OK"));
    }

    #[test]
    fn assemble_command_response_ok() {
        let lines = vec!["OK".to_string()];
        let resp = assemble_response(CommandKind::Command, &lines).unwrap();
        assert!(resp.data_line.is_none());
    }

    #[test]
    fn assemble_query_with_terminator() {
        let lines = vec!["GPIO=0F".to_string(), "OK".to_string()];
        let resp = assemble_response(CommandKind::QueryWithTerminator, &lines).unwrap();
        assert_eq!(resp.data_line.as_deref(), Some("GPIO=0F"));
    }

    #[test]
    fn assemble_propagates_device_error() {
        let lines = vec!["!0 Err: bad arg".to_string()];
        let err = assemble_response(CommandKind::Command, &lines).unwrap_err();
        matches!(err, ControlError::DeviceError { .. });
    }
}
