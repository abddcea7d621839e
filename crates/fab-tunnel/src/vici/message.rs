//! VICI message tree.
//!
//! A message is an ordered list of named elements. Each element is a key/value
//! pair, a list of values or a nested section.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TunnelError};

const SECTION_START: u8 = 1;
const SECTION_END: u8 = 2;
const KEY_VALUE: u8 = 3;
const LIST_START: u8 = 4;
const LIST_ITEM: u8 = 5;
const LIST_END: u8 = 6;

/// One element of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// A single value.
    Value(Vec<u8>),
    /// A list of values.
    List(Vec<Vec<u8>>),
    /// A nested section.
    Section(Message),
}

/// An ordered VICI message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    entries: Vec<(String, Element)>,
}

impl Message {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a key/value pair.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        self.push_value(key, value);
        self
    }

    /// Appends a list.
    #[must_use]
    pub fn with_list<I, V>(mut self, key: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        self.push_list(key, items);
        self
    }

    /// Appends a section.
    #[must_use]
    pub fn with_section(mut self, key: impl Into<String>, section: Message) -> Self {
        self.push_section(key, section);
        self
    }

    /// Appends a key/value pair in place.
    pub fn push_value(&mut self, key: impl Into<String>, value: impl AsRef<[u8]>) {
        self.entries
            .push((key.into(), Element::Value(value.as_ref().to_vec())));
    }

    /// Appends a list in place.
    pub fn push_list<I, V>(&mut self, key: impl Into<String>, items: I)
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        let items = items.into_iter().map(|v| v.as_ref().to_vec()).collect();
        self.entries.push((key.into(), Element::List(items)));
    }

    /// Appends a section in place.
    pub fn push_section(&mut self, key: impl Into<String>, section: Message) {
        self.entries.push((key.into(), Element::Section(section)));
    }

    /// Returns the first element with the given key.
    pub fn get(&self, key: &str) -> Option<&Element> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, element)| element)
    }

    /// Returns a value as a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Element::Value(v) => Some(String::from_utf8_lossy(v).into_owned()),
            _ => None,
        }
    }

    /// Returns a list as strings; missing keys yield an empty list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Element::List(items)) => items
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Returns a nested section.
    pub fn get_section(&self, key: &str) -> Option<&Message> {
        match self.get(key)? {
            Element::Section(section) => Some(section),
            _ => None,
        }
    }

    /// Iterates over all nested sections with their names.
    pub fn sections(&self) -> impl Iterator<Item = (&str, &Message)> {
        self.entries.iter().filter_map(|(k, element)| match element {
            Element::Section(section) => Some((k.as_str(), section)),
            _ => None,
        })
    }

    /// Returns true if the message has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the message body.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        for (key, element) in &self.entries {
            match element {
                Element::Value(value) => {
                    dst.put_u8(KEY_VALUE);
                    put_name(dst, key)?;
                    put_value(dst, value)?;
                }
                Element::List(items) => {
                    dst.put_u8(LIST_START);
                    put_name(dst, key)?;
                    for item in items {
                        dst.put_u8(LIST_ITEM);
                        put_value(dst, item)?;
                    }
                    dst.put_u8(LIST_END);
                }
                Element::Section(section) => {
                    dst.put_u8(SECTION_START);
                    put_name(dst, key)?;
                    section.encode(dst)?;
                    dst.put_u8(SECTION_END);
                }
            }
        }
        Ok(())
    }

    /// Parses a message body that spans all of `src`.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        let mut stack: Vec<(String, Message)> = Vec::new();
        let mut current = Message::new();

        while src.has_remaining() {
            match src.get_u8() {
                SECTION_START => {
                    let name = take_name(&mut src)?;
                    stack.push((name, std::mem::take(&mut current)));
                }
                SECTION_END => {
                    let (name, mut parent) = stack.pop().ok_or_else(|| {
                        TunnelError::Malformed("unbalanced section end".to_string())
                    })?;
                    parent.push_section(name, std::mem::take(&mut current));
                    current = parent;
                }
                KEY_VALUE => {
                    let key = take_name(&mut src)?;
                    let value = take_value(&mut src)?;
                    current.entries.push((key, Element::Value(value)));
                }
                LIST_START => {
                    let key = take_name(&mut src)?;
                    let mut items = Vec::new();
                    loop {
                        if !src.has_remaining() {
                            return Err(TunnelError::Malformed("unterminated list".to_string()));
                        }
                        match src.get_u8() {
                            LIST_ITEM => items.push(take_value(&mut src)?),
                            LIST_END => break,
                            other => {
                                return Err(TunnelError::Malformed(format!(
                                    "unexpected element {other} in list '{key}'"
                                )));
                            }
                        }
                    }
                    current.entries.push((key, Element::List(items)));
                }
                other => {
                    return Err(TunnelError::Malformed(format!("unknown element type {other}")));
                }
            }
        }

        if !stack.is_empty() {
            return Err(TunnelError::Malformed("unterminated section".to_string()));
        }
        Ok(current)
    }
}

pub(crate) fn put_name(dst: &mut BytesMut, name: &str) -> Result<()> {
    let len = u8::try_from(name.len())
        .map_err(|_| TunnelError::Malformed(format!("name too long: {name}")))?;
    dst.put_u8(len);
    dst.put_slice(name.as_bytes());
    Ok(())
}

fn put_value(dst: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| TunnelError::Malformed(format!("value too long: {} bytes", value.len())))?;
    dst.put_u16(len);
    dst.put_slice(value);
    Ok(())
}

pub(crate) fn take_name(src: &mut &[u8]) -> Result<String> {
    if !src.has_remaining() {
        return Err(TunnelError::Malformed("truncated name".to_string()));
    }
    let len = usize::from(src.get_u8());
    if src.remaining() < len {
        return Err(TunnelError::Malformed("truncated name".to_string()));
    }
    let name = String::from_utf8_lossy(&src[..len]).into_owned();
    src.advance(len);
    Ok(name)
}

fn take_value(src: &mut &[u8]) -> Result<Vec<u8>> {
    if src.remaining() < 2 {
        return Err(TunnelError::Malformed("truncated value".to_string()));
    }
    let len = usize::from(src.get_u16());
    if src.remaining() < len {
        return Err(TunnelError::Malformed("truncated value".to_string()));
    }
    let value = src[..len].to_vec();
    src.advance(len);
    Ok(value)
}
