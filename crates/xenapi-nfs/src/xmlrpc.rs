//! XML-RPC wire format as spoken by XAPI.
//!
//! Covers `methodCall` encoding, `methodResponse` decoding, and the XenAPI
//! result envelope that wraps every response value:
//!
//! ```text
//! { "Status": "Success", "Value": … }
//! { "Status": "Failure", "ErrorDescription": ["CODE", "param", …] }
//! ```
//!
//! Typed records are obtained by converting a [`Value`] into
//! `serde_json::Value` and deserialising from there.

use crate::error::{XenApiError, XenApiFailure, XenApiResult};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{Cursor, Write};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Value model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Boolean(bool),
    Double(f64),
    DateTime(String),
    Base64(Vec<u8>),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    Nil,
}

impl Value {
    /// Build a struct value from `(key, value)` pairs.
    pub fn structure<K, I>(members: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Struct(members.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Struct member lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members.get(key),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::String(s.clone())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, String>> for Value {
    fn from(map: BTreeMap<String, String>) -> Self {
        Value::Struct(map.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
    }
}

impl From<&BTreeMap<String, String>> for Value {
    fn from(map: &BTreeMap<String, String>) -> Self {
        Value::from(map.clone())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Struct(map)
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) | Value::DateTime(s) => serde_json::Value::String(s),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Boolean(b) => serde_json::Value::Bool(b),
            Value::Double(d) => serde_json::Number::from_f64(d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Base64(bytes) => serde_json::Value::String(BASE64.encode(bytes)),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Struct(members) => serde_json::Value::Object(
                members.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
            Value::Nil => serde_json::Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Double(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(members) => {
                Value::Struct(members.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Deserialise a typed result out of an XML-RPC value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> XenApiResult<T> {
    Ok(serde_json::from_value(value.into())?)
}

/// Serialise a typed argument (e.g. a record struct) into an XML-RPC value.
pub fn to_value<T: Serialize>(arg: &T) -> XenApiResult<Value> {
    Ok(serde_json::to_value(arg)?.into())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  XenAPI envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build a `Status: Success` envelope.
pub fn envelope_success(value: Value) -> Value {
    Value::structure([("Status", Value::from("Success")), ("Value", value)])
}

/// Build a `Status: Failure` envelope.
pub fn envelope_failure<S: AsRef<str>>(code: &str, params: &[S]) -> Value {
    let mut description = vec![Value::from(code)];
    description.extend(params.iter().map(|p| Value::from(p.as_ref())));
    Value::structure([
        ("Status", Value::from("Failure")),
        ("ErrorDescription", Value::Array(description)),
    ])
}

/// Unwrap a XenAPI envelope returned by `method`, turning `Failure` into an
/// error that carries the original `ErrorDescription`.
pub fn unwrap_envelope(method: &str, response: Value) -> XenApiResult<Value> {
    let Value::Struct(mut fields) = response else {
        return Err(XenApiError::protocol(format!(
            "{method}: response is not a XenAPI envelope"
        )));
    };

    let status = fields.remove("Status");
    match status.as_ref().and_then(Value::as_str) {
        Some("Success") => Ok(fields.remove("Value").unwrap_or(Value::Nil)),
        Some("Failure") => {
            let description = match fields.remove("ErrorDescription") {
                Some(Value::Array(items)) => items.iter().map(describe).collect(),
                Some(other) => vec![describe(&other)],
                None => Vec::new(),
            };
            Err(XenApiError::failure(
                method,
                XenApiFailure::from_description(description),
            ))
        }
        other => Err(XenApiError::protocol(format!(
            "{method}: unexpected envelope status {other:?}"
        ))),
    }
}

fn describe(v: &Value) -> String {
    match v {
        Value::String(s) | Value::DateTime(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Double(d) => d.to_string(),
        other => format!("{other:?}"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Encoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn write_err<E: std::fmt::Display>(e: E) -> XenApiError {
    XenApiError::protocol(format!("XML write error: {e}"))
}

fn open<W: Write>(w: &mut Writer<W>, tag: &str) -> XenApiResult<()> {
    w.write_event(Event::Start(BytesStart::new(tag)))
        .map_err(write_err)
}

fn close<W: Write>(w: &mut Writer<W>, tag: &str) -> XenApiResult<()> {
    w.write_event(Event::End(BytesEnd::new(tag))).map_err(write_err)
}

fn text_element<W: Write>(w: &mut Writer<W>, tag: &str, text: &str) -> XenApiResult<()> {
    open(w, tag)?;
    w.write_event(Event::Text(BytesText::new(text)))
        .map_err(write_err)?;
    close(w, tag)
}

fn write_value<W: Write>(w: &mut Writer<W>, value: &Value) -> XenApiResult<()> {
    open(w, "value")?;
    match value {
        Value::String(s) => text_element(w, "string", s)?,
        Value::Int(i) => text_element(w, "int", &i.to_string())?,
        Value::Boolean(b) => text_element(w, "boolean", if *b { "1" } else { "0" })?,
        Value::Double(d) => text_element(w, "double", &d.to_string())?,
        Value::DateTime(s) => text_element(w, "dateTime.iso8601", s)?,
        Value::Base64(bytes) => text_element(w, "base64", &BASE64.encode(bytes))?,
        Value::Array(items) => {
            open(w, "array")?;
            open(w, "data")?;
            for item in items {
                write_value(w, item)?;
            }
            close(w, "data")?;
            close(w, "array")?;
        }
        Value::Struct(members) => {
            open(w, "struct")?;
            for (name, member) in members {
                open(w, "member")?;
                text_element(w, "name", name)?;
                write_value(w, member)?;
                close(w, "member")?;
            }
            close(w, "struct")?;
        }
        Value::Nil => w
            .write_event(Event::Empty(BytesStart::new("nil")))
            .map_err(write_err)?,
    }
    close(w, "value")
}

/// Encode a `methodCall` document.
pub fn encode_call(method: &str, params: &[Value]) -> XenApiResult<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
        .map_err(write_err)?;

    open(&mut writer, "methodCall")?;
    text_element(&mut writer, "methodName", method)?;
    open(&mut writer, "params")?;
    for param in params {
        open(&mut writer, "param")?;
        write_value(&mut writer, param)?;
        close(&mut writer, "param")?;
    }
    close(&mut writer, "params")?;
    close(&mut writer, "methodCall")?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| XenApiError::protocol(format!("Encoded call is not UTF-8: {e}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Tag {
    Start(String),
    End(String),
    Eof,
}

fn tag_name(name: QName<'_>) -> String {
    String::from_utf8_lossy(name.as_ref()).into_owned()
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    fn new(xml: &'a str) -> Self {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().expand_empty_elements = true;
        Self { reader }
    }

    fn next(&mut self) -> XenApiResult<Event<'a>> {
        loop {
            match self.reader.read_event() {
                Ok(Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_)) => {
                    continue
                }
                Ok(event) => return Ok(event),
                Err(e) => {
                    return Err(XenApiError::protocol(format!(
                        "XML error at position {}: {e}",
                        self.reader.buffer_position()
                    )))
                }
            }
        }
    }

    /// Next structural tag; whitespace between tags is skipped.
    fn next_tag(&mut self) -> XenApiResult<Tag> {
        loop {
            match self.next()? {
                Event::Start(e) => return Ok(Tag::Start(tag_name(e.name()))),
                Event::End(e) => return Ok(Tag::End(tag_name(e.name()))),
                Event::Eof => return Ok(Tag::Eof),
                Event::Text(t) if t.iter().all(u8::is_ascii_whitespace) => continue,
                Event::Text(t) => {
                    return Err(XenApiError::protocol(format!(
                        "Unexpected text '{}'",
                        String::from_utf8_lossy(&t)
                    )))
                }
                _ => continue,
            }
        }
    }

    fn expect_start(&mut self, expected: &str) -> XenApiResult<()> {
        match self.next_tag()? {
            Tag::Start(name) if name == expected => Ok(()),
            Tag::Start(name) => Err(XenApiError::protocol(format!(
                "Expected <{expected}>, found <{name}>"
            ))),
            Tag::End(name) => Err(XenApiError::protocol(format!(
                "Expected <{expected}>, found </{name}>"
            ))),
            Tag::Eof => Err(XenApiError::protocol(format!(
                "Expected <{expected}>, found end of document"
            ))),
        }
    }

    fn expect_end(&mut self, expected: &str) -> XenApiResult<()> {
        match self.next_tag()? {
            Tag::End(name) if name == expected => Ok(()),
            Tag::Start(name) => Err(XenApiError::protocol(format!(
                "Expected </{expected}>, found <{name}>"
            ))),
            Tag::End(name) => Err(XenApiError::protocol(format!(
                "Expected </{expected}>, found </{name}>"
            ))),
            Tag::Eof => Err(XenApiError::protocol(format!(
                "Expected </{expected}>, found end of document"
            ))),
        }
    }

    /// Collect character data up to `</end>`.
    fn read_text(&mut self, end: &str) -> XenApiResult<String> {
        let mut text = String::new();
        loop {
            match self.next()? {
                Event::Text(t) => {
                    let unescaped = t
                        .unescape()
                        .map_err(|e| XenApiError::protocol(format!("Bad escape: {e}")))?;
                    text.push_str(&unescaped);
                }
                Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
                Event::End(e) if tag_name(e.name()) == end => return Ok(text),
                Event::End(e) => {
                    return Err(XenApiError::protocol(format!(
                        "Expected </{end}>, found </{}>",
                        tag_name(e.name())
                    )))
                }
                Event::Start(e) => {
                    return Err(XenApiError::protocol(format!(
                        "Unexpected <{}> inside <{end}>",
                        tag_name(e.name())
                    )))
                }
                Event::Eof => {
                    return Err(XenApiError::protocol(format!(
                        "End of document inside <{end}>"
                    )))
                }
                _ => {}
            }
        }
    }

    /// Parse the body of a `<value>` whose start tag was already consumed.
    fn parse_value(&mut self) -> XenApiResult<Value> {
        let mut text = String::new();
        loop {
            match self.next()? {
                Event::Text(t) => {
                    let unescaped = t
                        .unescape()
                        .map_err(|e| XenApiError::protocol(format!("Bad escape: {e}")))?;
                    text.push_str(&unescaped);
                }
                Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
                // Untyped values are strings.
                Event::End(e) if tag_name(e.name()) == "value" => return Ok(Value::String(text)),
                Event::End(e) => {
                    return Err(XenApiError::protocol(format!(
                        "Expected </value>, found </{}>",
                        tag_name(e.name())
                    )))
                }
                Event::Start(e) => {
                    let name = tag_name(e.name());
                    let value = self.parse_typed(&name)?;
                    self.expect_end("value")?;
                    return Ok(value);
                }
                Event::Eof => {
                    return Err(XenApiError::protocol("End of document inside <value>"))
                }
                _ => {}
            }
        }
    }

    fn parse_typed(&mut self, name: &str) -> XenApiResult<Value> {
        match name {
            "string" => Ok(Value::String(self.read_text("string")?)),
            "int" | "i4" | "i8" => {
                let text = self.read_text(name)?;
                text.trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|e| XenApiError::protocol(format!("Bad <{name}> '{text}': {e}")))
            }
            "boolean" => match self.read_text("boolean")?.trim() {
                "1" | "true" => Ok(Value::Boolean(true)),
                "0" | "false" => Ok(Value::Boolean(false)),
                other => Err(XenApiError::protocol(format!("Bad <boolean> '{other}'"))),
            },
            "double" => {
                let text = self.read_text("double")?;
                text.trim()
                    .parse::<f64>()
                    .map(Value::Double)
                    .map_err(|e| XenApiError::protocol(format!("Bad <double> '{text}': {e}")))
            }
            "dateTime.iso8601" => Ok(Value::DateTime(
                self.read_text("dateTime.iso8601")?.trim().to_string(),
            )),
            "base64" => {
                let text = self.read_text("base64")?;
                let compact: String = text.split_whitespace().collect();
                BASE64
                    .decode(compact)
                    .map(Value::Base64)
                    .map_err(|e| XenApiError::protocol(format!("Bad <base64>: {e}")))
            }
            "nil" => {
                self.expect_end("nil")?;
                Ok(Value::Nil)
            }
            "array" => {
                self.expect_start("data")?;
                let mut items = Vec::new();
                loop {
                    match self.next_tag()? {
                        Tag::Start(tag) if tag == "value" => items.push(self.parse_value()?),
                        Tag::End(tag) if tag == "data" => break,
                        _ => return Err(XenApiError::protocol("Malformed <array>")),
                    }
                }
                self.expect_end("array")?;
                Ok(Value::Array(items))
            }
            "struct" => {
                let mut members = BTreeMap::new();
                loop {
                    match self.next_tag()? {
                        Tag::Start(tag) if tag == "member" => {
                            self.expect_start("name")?;
                            let key = self.read_text("name")?;
                            self.expect_start("value")?;
                            let value = self.parse_value()?;
                            self.expect_end("member")?;
                            members.insert(key, value);
                        }
                        Tag::End(tag) if tag == "struct" => break,
                        _ => return Err(XenApiError::protocol("Malformed <struct>")),
                    }
                }
                Ok(Value::Struct(members))
            }
            other => Err(XenApiError::protocol(format!(
                "Unsupported XML-RPC type <{other}>"
            ))),
        }
    }
}

/// Decode a `methodResponse` document into its single result value.
///
/// An XML-RPC `<fault>` is reported as a protocol error.
pub fn decode_response(xml: &str) -> XenApiResult<Value> {
    let mut parser = Parser::new(xml);
    parser.expect_start("methodResponse")?;

    match parser.next_tag()? {
        Tag::Start(tag) if tag == "params" => {
            parser.expect_start("param")?;
            parser.expect_start("value")?;
            let value = parser.parse_value()?;
            parser.expect_end("param")?;
            parser.expect_end("params")?;
            parser.expect_end("methodResponse")?;
            Ok(value)
        }
        Tag::Start(tag) if tag == "fault" => {
            parser.expect_start("value")?;
            let fault = parser.parse_value()?;
            let code = fault.get("faultCode").map(describe).unwrap_or_default();
            let reason = fault.get("faultString").map(describe).unwrap_or_default();
            Err(XenApiError::protocol(format!(
                "XML-RPC fault {code}: {reason}"
            )))
        }
        _ => Err(XenApiError::protocol(
            "methodResponse contains neither <params> nor <fault>",
        )),
    }
}
