use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A request/response pair as it is keyed, scrubbed, persisted and replayed.
///
/// `response` stays `None` while the request half is being normalized and fingerprinted; a
/// persisted fixture always carries one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub request: RequestRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    /// Origin-form target: path plus query string, exactly as received.
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Body,
}

/// Ordered header pairs. Names are lowercased on insertion, values are kept byte-for-byte and
/// repeated names keep their arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, Vec<u8>)>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body(Vec<u8>);

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredBytes {
    Text(String),
    Bytes(Vec<u8>),
}

impl StoredBytes {
    fn from_slice(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::Text(text.to_owned()),
            Err(_) => Self::Bytes(bytes.to_vec()),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

impl Interaction {
    pub fn new(request: RequestRecord) -> Self {
        Self {
            request,
            response: None,
        }
    }
}

impl RequestRecord {
    /// Builds the request half from an inbound request whose body is already buffered.
    pub fn from_parts(parts: &hyper::http::request::Parts, body: &[u8]) -> Self {
        let url = parts
            .uri
            .path_and_query()
            .map(|path_and_query| path_and_query.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        Self {
            method: parts.method.as_str().to_owned(),
            url,
            headers: Headers::from_header_map(&parts.headers),
            body: Body::from(body),
        }
    }
}

impl ResponseRecord {
    pub fn new(status: u16, headers: Headers, body: impl Into<Body>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_header_map(map: &hyper::HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map {
            headers.append(name.as_str(), value.as_bytes());
        }
        headers
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_slice()))
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.0
            .iter()
            .filter(move |(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn append(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.0.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Replaces every value of `name` with a single `value`, keeping the position of the first
    /// occurrence.
    pub fn set(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        match self
            .0
            .iter()
            .position(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        {
            Some(first) => {
                self.0[first].1 = value;
                let mut idx = 0usize;
                self.0.retain(|(candidate, _)| {
                    let keep = idx <= first || !candidate.eq_ignore_ascii_case(name);
                    idx += 1;
                    keep
                });
            }
            None => self.append(name, value),
        }
    }

    /// Removes every value of `name`, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0
            .retain(|(candidate, _)| !candidate.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    pub fn values_mut(&mut self, name: &str) -> impl Iterator<Item = &mut Vec<u8>> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter_mut()
            .filter(move |(candidate, _)| *candidate == name)
            .map(|(_, value)| value)
    }

    pub(crate) fn as_pairs(&self) -> &[(String, Vec<u8>)] {
        &self.0
    }
}

impl<N: AsRef<str>, V: Into<Vec<u8>>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name.as_ref(), value);
        }
        headers
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            self.0
                .iter()
                .map(|(name, value)| (name, StoredBytes::from_slice(value))),
        )
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs: Vec<(String, StoredBytes)> = Vec::deserialize(deserializer)?;
        Ok(pairs
            .into_iter()
            .map(|(name, value)| (name, value.into_bytes()))
            .collect())
    }
}

impl Body {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for Body {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<bytes::Bytes> for Body {
    fn from(value: bytes::Bytes) -> Self {
        Self(value.to_vec())
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StoredBytes::from_slice(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(StoredBytes::deserialize(deserializer)?.into_bytes()))
    }
}
