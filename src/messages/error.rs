// Standard library imports
use std::fmt::{Display, Formatter};

// Internal crate imports
use crate::errors::Error;

/// ErrorResponse / NoticeResponse fields the pooler cares about.
/// See: https://www.postgresql.org/docs/current/protocol-error-fields.html
#[derive(Debug, Default, PartialEq)]
pub struct PgErrorMsg {
    pub severity_localized: String, // S
    pub severity: String,           // V
    pub code: String,               // C
    pub message: String,            // M
    pub detail: Option<String>,     // D
    pub hint: Option<String>,       // H
    pub position: Option<u32>,      // P
    pub where_context: Option<String>, // W
    pub routine: Option<String>,    // R
}

impl Display for PgErrorMsg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} [{}]",
            self.severity_localized, self.message, self.code
        )?;
        if let Some(val) = &self.detail {
            write!(f, "[detail: {val}]")?;
        }
        if let Some(val) = &self.hint {
            write!(f, "[hint: {val}]")?;
        }
        if let Some(val) = &self.position {
            write!(f, "[position: {val}]")?;
        }
        if let Some(val) = &self.where_context {
            write!(f, "[where: {val}]")?;
        }
        if let Some(val) = &self.routine {
            write!(f, "[routine: {val}]")?;
        }
        Ok(())
    }
}

impl PgErrorMsg {
    /// Parse the body of an ErrorResponse (everything after code and length).
    pub fn parse(error_msg: &[u8]) -> Result<PgErrorMsg, Error> {
        let mut out = PgErrorMsg::default();

        let mut fields = error_msg.split(|b| *b == 0);
        while let Some(field) = fields.next() {
            let (field_type, content) = match field.split_first() {
                Some((field_type, content)) => (*field_type, content),
                // Terminator.
                None => break,
            };
            let content = String::from_utf8_lossy(content).to_string();
            match field_type {
                b'S' => out.severity_localized = content,
                b'V' => out.severity = content,
                b'C' => out.code = content,
                b'M' => out.message = content,
                b'D' => out.detail = Some(content),
                b'H' => out.hint = Some(content),
                b'P' => out.position = content.parse().ok(),
                b'W' => out.where_context = Some(content),
                b'R' => out.routine = Some(content),
                _ => {}
            }
        }

        if out.code.is_empty() && out.message.is_empty() {
            return Err(Error::ServerMessageParserError(
                "ErrorResponse without code and message".to_string(),
            ));
        }

        Ok(out)
    }
}
