use std::fmt;

use bson::{Bson, Document};

use crate::protocol::Opcode;
use crate::request::Request;
use crate::MockodbError;

/// A partial specification of a request: every constraint present must hold,
/// anything unspecified is ignored. Used both to select which request
/// `receive` delivers next and to assert a request's shape.
#[derive(Default, Clone)]
pub struct MatchPattern {
    opcode: Option<Opcode>,
    namespace: Option<String>,
    command_names: Vec<String>,
    doc: Option<Document>,
    flags_set: u32,
    flags_clear: u32,
    absent: Vec<String>,
}

impl MatchPattern {
    /// Matches every request.
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches a command by name, compared case-insensitively the way the
    /// server resolves command names.
    pub fn command(name: &str) -> Self {
        Self::any().command_name(name)
    }

    pub fn command_name(mut self, name: &str) -> Self {
        self.command_names.push(name.to_string());
        self
    }

    /// Matches any of several command names, e.g. the isMaster/hello
    /// handshake family.
    pub fn command_any<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pattern = Self::any();
        pattern.command_names = names.into_iter().map(Into::into).collect();
        pattern
    }

    /// The isMaster/hello handshake family a driver uses for connection
    /// setup and monitoring.
    pub fn handshake() -> Self {
        Self::command_any(["ismaster", "hello"])
    }

    pub fn opcode(mut self, opcode: Opcode) -> Self {
        self.opcode = Some(opcode);
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Fields that must be present and equal in the request's principal
    /// document; nested documents are matched as subsets too.
    pub fn doc(mut self, doc: Document) -> Self {
        self.doc = Some(doc);
        self
    }

    /// All of `bits` must be set in the request's protocol flags.
    pub fn flags_set(mut self, bits: u32) -> Self {
        self.flags_set |= bits;
        self
    }

    /// None of `bits` may be set in the request's protocol flags.
    pub fn flags_clear(mut self, bits: u32) -> Self {
        self.flags_clear |= bits;
        self
    }

    /// Asserts the deliberate absence of a field, addressed by dotted path.
    pub fn absent(mut self, dotted_path: &str) -> Self {
        self.absent.push(dotted_path.to_string());
        self
    }

    pub fn matches(&self, request: &Request) -> bool {
        if let Some(opcode) = self.opcode {
            if request.opcode() != opcode {
                return false;
            }
        }
        if let Some(ns) = &self.namespace {
            if request.namespace() != Some(ns.as_str()) {
                return false;
            }
        }
        if !self.command_names.is_empty() {
            let Some(actual) = request.command_name() else {
                return false;
            };
            if !self
                .command_names
                .iter()
                .any(|name| name.eq_ignore_ascii_case(actual))
            {
                return false;
            }
        }
        let flags = request.flags();
        if flags & self.flags_set != self.flags_set || flags & self.flags_clear != 0 {
            return false;
        }
        if let Some(expected) = &self.doc {
            match request.principal_doc() {
                Some(actual) => {
                    if !subset_matches(expected, actual) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        for path in &self.absent {
            let Some(doc) = request.principal_doc() else {
                continue;
            };
            if lookup_path(doc, path).is_some() {
                return false;
            }
        }
        true
    }

    /// Like [`matches`](Self::matches), but a mismatch becomes a descriptive
    /// failure carrying both sides.
    pub fn assert_matches(&self, request: &Request) -> Result<(), MockodbError> {
        if self.matches(request) {
            Ok(())
        } else {
            Err(MockodbError::Mismatch {
                expected: self.to_string(),
                actual: request.to_string(),
            })
        }
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(opcode) = self.opcode {
            parts.push(opcode.to_string());
        }
        if !self.command_names.is_empty() {
            parts.push(format!("command {}", self.command_names.join("|")));
        }
        if let Some(ns) = &self.namespace {
            parts.push(format!("ns={ns}"));
        }
        if let Some(doc) = &self.doc {
            parts.push(doc.to_string());
        }
        if self.flags_set != 0 {
            parts.push(format!("flags&{:#x}", self.flags_set));
        }
        if self.flags_clear != 0 {
            parts.push(format!("!flags&{:#x}", self.flags_clear));
        }
        for path in &self.absent {
            parts.push(format!("absent({path})"));
        }
        if parts.is_empty() {
            f.write_str("any request")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

impl fmt::Debug for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MatchPattern({self})")
    }
}

/// Every field of `expected` must exist in `actual` and compare equal;
/// `actual` may carry extra fields at any level.
pub(crate) fn subset_matches(expected: &Document, actual: &Document) -> bool {
    expected.iter().all(|(key, value)| match actual.get(key) {
        Some(actual_value) => bson_eq(value, actual_value),
        None => false,
    })
}

fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Document(x), Bson::Document(y)) => subset_matches(x, y),
        (Bson::Array(x), Bson::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| bson_eq(l, r))
        }
        // Drivers pick int width by value; 1, 1_i64 and 1.0 all mean 1.
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn lookup_path<'a>(doc: &'a Document, dotted_path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let mut segments = dotted_path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = current.get(segment)?;
        if segments.peek().is_none() {
            return Some(value);
        }
        match value {
            Bson::Document(inner) => current = inner,
            _ => return None,
        }
    }
    None
}
