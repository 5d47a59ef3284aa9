//! Required-field checks for GTFS-RT payloads.
//!
//! prost fills a missing proto2 `required` field with its default, so an
//! entity without an `id` or a position without coordinates decodes without
//! complaint. [`check_required`] walks the wire bytes against the descriptor
//! set compiled from `proto/gtfs-realtime.proto` and reports the first
//! required field that was never sent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

use prost::encoding::{WireType, decode_key, decode_varint};
use prost::{DecodeError, Message};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{DescriptorProto, FileDescriptorSet};
use thiserror::Error;

/// Serialized `FileDescriptorSet` written by `build.rs`.
pub(crate) const DESCRIPTOR_SET: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/gtfs_realtime_descriptor.bin"));

/// Fully qualified name of the feed root message.
pub(crate) const FEED_MESSAGE: &str = ".transit_realtime.FeedMessage";

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("required field {message}.{field} is not set")]
    MissingRequired { message: String, field: String },
    #[error("malformed field data: {0}")]
    Wire(#[from] DecodeError),
    #[error("field data runs past the end of its message")]
    Truncated,
    #[error("end-group tag {0} has no matching start")]
    UnmatchedGroup(u32),
    #[error("schema descriptor set is unreadable: {0}")]
    Descriptor(DecodeError),
}

struct FieldRule {
    /// Fully qualified type name when the field holds a message.
    message: Option<String>,
    repeated: bool,
}

struct MessageRules {
    name: String,
    fields: HashMap<u32, FieldRule>,
    required: Vec<(u32, String)>,
}

impl MessageRules {
    fn new(name: &str, desc: &DescriptorProto) -> Self {
        let tag = |number: i32| number as u32;

        Self {
            name: name.trim_start_matches('.').to_string(),
            fields: desc
                .field
                .iter()
                .map(|f| {
                    let rule = FieldRule {
                        message: (f.r#type() == Type::Message).then(|| f.type_name().to_string()),
                        repeated: f.label() == Label::Repeated,
                    };
                    (tag(f.number()), rule)
                })
                .collect(),
            required: desc
                .field
                .iter()
                .filter(|f| f.label() == Label::Required)
                .map(|f| (tag(f.number()), f.name().to_string()))
                .collect(),
        }
    }
}

/// Presence rules for every message in a descriptor set.
pub struct Schema {
    messages: HashMap<String, MessageRules>,
}

impl Schema {
    pub fn from_descriptor_set(bytes: &[u8]) -> Result<Self, DecodeError> {
        let set = FileDescriptorSet::decode(bytes)?;
        let messages = message_descriptors(&set)
            .into_iter()
            .map(|(name, desc)| {
                let rules = MessageRules::new(&name, desc);
                (name, rules)
            })
            .collect();
        Ok(Self { messages })
    }

    /// Checks that `bytes`, encoded as the message named `message`, carries
    /// every required field, and so do all the messages nested inside it.
    ///
    /// Messages the descriptor set does not know are accepted as they are.
    pub fn check(&self, message: &str, bytes: &[u8]) -> Result<(), PresenceError> {
        let Some(rules) = self.messages.get(message) else {
            return Ok(());
        };

        let mut buf = bytes;
        let mut seen = HashSet::new();
        // A singular message field sent more than once is merged into one
        // value, so its parts are only checked together.
        let mut singular: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        while !buf.is_empty() {
            let (tag, wire_type) = decode_key(&mut buf)?;
            seen.insert(tag);

            if wire_type != WireType::LengthDelimited {
                skip(wire_type, tag, &mut buf)?;
                continue;
            }

            let payload = length_delimited(&mut buf)?;
            match rules.fields.get(&tag) {
                Some(FieldRule {
                    message: Some(child),
                    repeated: true,
                }) => self.check(child, payload)?,
                Some(FieldRule {
                    message: Some(_),
                    repeated: false,
                }) => singular.entry(tag).or_default().extend_from_slice(payload),
                _ => {}
            }
        }

        for (tag, payload) in &singular {
            if let Some(FieldRule {
                message: Some(child),
                ..
            }) = rules.fields.get(tag)
            {
                self.check(child, payload)?;
            }
        }

        match rules.required.iter().find(|(tag, _)| !seen.contains(tag)) {
            Some((_, field)) => Err(PresenceError::MissingRequired {
                message: rules.name.clone(),
                field: field.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Checks an encoded `FeedMessage` for unset required fields.
///
/// An empty body fails here: it has no `header`.
pub fn check_required(bytes: &[u8]) -> Result<(), PresenceError> {
    schema()?.check(FEED_MESSAGE, bytes)
}

fn schema() -> Result<&'static Schema, PresenceError> {
    static SCHEMA: OnceLock<Result<Schema, DecodeError>> = OnceLock::new();

    SCHEMA
        .get_or_init(|| Schema::from_descriptor_set(DESCRIPTOR_SET))
        .as_ref()
        .map_err(|e| PresenceError::Descriptor(e.clone()))
}

/// Every message in `set`, nested ones included, keyed by its fully
/// qualified name (`.transit_realtime.TripUpdate.StopTimeEvent`).
pub(crate) fn message_descriptors(set: &FileDescriptorSet) -> HashMap<String, &DescriptorProto> {
    fn collect<'a>(
        scope: &str,
        desc: &'a DescriptorProto,
        out: &mut HashMap<String, &'a DescriptorProto>,
    ) {
        let name = format!("{scope}.{}", desc.name());
        for nested in &desc.nested_type {
            collect(&name, nested, out);
        }
        out.insert(name, desc);
    }

    let mut out = HashMap::new();
    for file in &set.file {
        let scope = match file.package() {
            "" => String::new(),
            package => format!(".{package}"),
        };
        for desc in &file.message_type {
            collect(&scope, desc, &mut out);
        }
    }
    out
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], PresenceError> {
    if buf.len() < len {
        return Err(PresenceError::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn length_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], PresenceError> {
    let len = usize::try_from(decode_varint(buf)?).map_err(|_| PresenceError::Truncated)?;
    take(buf, len)
}

fn skip(wire_type: WireType, tag: u32, buf: &mut &[u8]) -> Result<(), PresenceError> {
    match wire_type {
        WireType::Varint => {
            decode_varint(buf)?;
        }
        WireType::SixtyFourBit => {
            take(buf, 8)?;
        }
        WireType::ThirtyTwoBit => {
            take(buf, 4)?;
        }
        WireType::LengthDelimited => {
            length_delimited(buf)?;
        }
        WireType::StartGroup => loop {
            let (inner, inner_type) = decode_key(buf)?;
            if inner_type == WireType::EndGroup {
                if inner != tag {
                    return Err(PresenceError::UnmatchedGroup(inner));
                }
                break;
            }
            skip(inner_type, inner, buf)?;
        },
        WireType::EndGroup => return Err(PresenceError::UnmatchedGroup(tag)),
    }
    Ok(())
}
