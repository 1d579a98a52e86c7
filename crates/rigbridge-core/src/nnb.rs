//! Mapping buffer ("nnb") document format
//!
//! A mapping buffer is an XML document listing every registered bone group:
//!
//! ```xml
//! <nnb version="1.0">
//!   <bone_group index="0" source_name_group="hips_bb_" destination_name_group="Root,Hips" .../>
//!   <bone_group index="1" parent="0" source_name_group="spine_bb_,spine1_bb_" .../>
//! </nnb>
//! ```
//!
//! `source_name_group` lists template bone names and `destination_name_group`
//! the user node names of the group, both comma separated.

use quick_xml::de::from_str;
use quick_xml::events::Event;
use quick_xml::se::to_string;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current document version
pub const NNB_VERSION: &str = "1.0";

/// Separator of the name and index lists inside one attribute
pub const LIST_SEPARATOR: char = ',';

#[derive(Error, Debug)]
pub enum NnbError {
    #[error("Failed to parse mapping document: {0}")]
    ParseError(String),
    #[error("Failed to serialize mapping document: {0}")]
    SerializeError(String),
    #[error("Mapping buffer is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Serialized mapping exchanged with the device, files and the network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingBuffer(Vec<u8>);

impl MappingBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Buffer as text, if it is valid UTF-8
    pub fn as_str(&self) -> Result<&str, NnbError> {
        Ok(std::str::from_utf8(&self.0)?)
    }

    /// `destination_name_group` value of every `bone_group` element
    pub fn destinations(&self) -> Result<Vec<String>, NnbError> {
        bone_group_destinations(&self.0)
    }
}

impl From<Vec<u8>> for MappingBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<String> for MappingBuffer {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

/// Root element of a mapping document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename = "nnb")]
pub struct MappingDocument {
    #[serde(rename = "@version", default)]
    pub version: String,
    #[serde(rename = "bone_group", default)]
    pub groups: Vec<BoneGroupRecord>,
}

/// One registered bone group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoneGroupRecord {
    #[serde(rename = "@index")]
    pub index: usize,
    #[serde(rename = "@parent", default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<usize>,
    #[serde(rename = "@source_name_group", default)]
    pub source_name_group: String,
    #[serde(rename = "@source_index_group", default)]
    pub source_index_group: String,
    #[serde(rename = "@destination_name_group", default)]
    pub destination_name_group: String,
    #[serde(rename = "@destination_index_group", default)]
    pub destination_index_group: String,
}

impl BoneGroupRecord {
    pub fn template_names(&self) -> Vec<&str> {
        split_list(&self.source_name_group)
    }

    pub fn user_names(&self) -> Vec<&str> {
        split_list(&self.destination_name_group)
    }

    pub fn template_indices(&self) -> Result<Vec<usize>, NnbError> {
        parse_indices(&self.source_index_group)
    }
}

impl MappingDocument {
    pub fn new() -> Self {
        Self {
            version: NNB_VERSION.to_string(),
            groups: Vec::new(),
        }
    }

    /// Parse a document from XML text
    pub fn from_xml(xml: &str) -> Result<Self, NnbError> {
        from_str(xml).map_err(|e| NnbError::ParseError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NnbError> {
        Self::from_xml(std::str::from_utf8(bytes)?)
    }

    /// Serialize to XML text. Output is deterministic for equal documents.
    pub fn to_xml(&self) -> Result<String, NnbError> {
        let xml = to_string(self).map_err(|e| NnbError::SerializeError(e.to_string()))?;
        Ok(format!("<?xml version='1.0'?>\n{}", xml))
    }

    pub fn to_buffer(&self) -> Result<MappingBuffer, NnbError> {
        Ok(MappingBuffer::from(self.to_xml()?))
    }
}

/// Join names or indices into one attribute value
pub fn join_list<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(&LIST_SEPARATOR.to_string())
}

fn split_list(value: &str) -> Vec<&str> {
    value
        .split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_indices(value: &str) -> Result<Vec<usize>, NnbError> {
    split_list(value)
        .into_iter()
        .map(|s| {
            s.parse()
                .map_err(|_| NnbError::ParseError(format!("invalid index '{}'", s)))
        })
        .collect()
}

/// Scan a mapping buffer for the `destination_name_group` of every `bone_group`.
///
/// Only the grouping records are looked at; the rest of the document may
/// use any layout.
pub fn bone_group_destinations(buf: &[u8]) -> Result<Vec<String>, NnbError> {
    let text = std::str::from_utf8(buf)?;
    let mut reader = Reader::from_str(text);
    let mut destinations = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"bone_group" => {
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| NnbError::ParseError(e.to_string()))?;
                    if attr.key.as_ref() == b"destination_name_group" {
                        let value = attr
                            .unescape_value()
                            .map_err(|e| NnbError::ParseError(e.to_string()))?;
                        destinations.push(value.into_owned());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(NnbError::ParseError(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }
    Ok(destinations)
}
