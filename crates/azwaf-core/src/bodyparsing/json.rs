//! `application/json` decoder
//!
//! Walks the document with a serde visitor instead of building a
//! `serde_json::Value`, so only the current string is held in memory.

use super::limits::ReadCounters;
use super::{FieldCallback, FieldType};
use crate::{Result, WafError};
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use std::fmt;
use std::io::{BufReader, Read};

struct Sink<'s, 'f> {
    on_field: &'s mut FieldCallback<'f>,
    counters: &'s ReadCounters,
    error: Option<WafError>,
}

impl Sink<'_, '_> {
    fn emit<E: de::Error>(&mut self, value: &str) -> std::result::Result<(), E> {
        self.counters.reset_field();
        (self.on_field)(FieldType::JsonContent, "", value.as_bytes()).map_err(|err| {
            self.error = Some(err);
            E::custom("field callback failed")
        })
    }
}

/// Visits one JSON value and everything nested in it
struct Node<'a, 's, 'f>(&'a mut Sink<'s, 'f>);

impl<'de> DeserializeSeed<'de> for Node<'_, '_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for Node<'_, '_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> std::result::Result<(), E> {
        Ok(())
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> std::result::Result<(), E> {
        Ok(())
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> std::result::Result<(), E> {
        Ok(())
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> std::result::Result<(), E> {
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<(), E> {
        Ok(())
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<(), E> {
        self.0.emit(v)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while seq.next_element_seed(Node(&mut *self.0))?.is_some() {}
        Ok(())
    }

    // Keys are not scanned
    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        while map.next_key::<IgnoredAny>()?.is_some() {
            map.next_value_seed(Node(&mut *self.0))?;
        }
        Ok(())
    }
}

/// Emit every string value as [`FieldType::JsonContent`] with an empty name
pub(crate) fn parse<R: Read>(reader: R, counters: &ReadCounters, on_field: &mut FieldCallback<'_>) -> Result<()> {
    let mut sink = Sink {
        on_field,
        counters,
        error: None,
    };

    let mut de = serde_json::Deserializer::from_reader(BufReader::new(reader));
    let result = Node(&mut sink).deserialize(&mut de).and_then(|()| de.end());

    if let Some(err) = sink.error {
        return Err(err);
    }
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_eof() && counters.total() == 0 => Ok(()),
        Err(e) => Err(WafError::BodyFormat {
            media_type: "application/json".into(),
            message: e.to_string(),
        }),
    }
}
