//! `application/xml` decoder

use super::limits::ReadCounters;
use super::{FieldCallback, FieldType};
use crate::{Result, WafError};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{BufReader, Read};

fn format_error(message: impl ToString) -> WafError {
    WafError::BodyFormat {
        media_type: "application/xml".into(),
        message: message.to_string(),
    }
}

/// Emit character data.
///
/// Whitespace-only text between elements is not emitted. Element names and
/// attributes are not scanned.
pub(crate) fn parse<R: Read>(reader: R, counters: &ReadCounters, on_field: &mut FieldCallback<'_>) -> Result<()> {
    let mut reader = Reader::from_reader(BufReader::new(reader));
    let mut buf = Vec::new();
    let mut depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Text(e)) if !e.iter().all(u8::is_ascii_whitespace) => {
                let text = e.unescape().map_err(format_error)?;
                counters.reset_field();
                on_field(FieldType::XmlCharData, "", text.as_bytes())?;
            }
            Ok(Event::CData(e)) => {
                counters.reset_field();
                on_field(FieldType::XmlCharData, "", &e.into_inner())?;
            }
            Ok(Event::Eof) if depth > 0 => return Err(format_error("unexpected end of document")),
            Ok(Event::Eof) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                return Err(format_error(format!(
                    "error at position {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
        buf.clear();
    }
}
