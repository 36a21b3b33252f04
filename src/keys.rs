use std::{fmt::Display, str::FromStr};

use itertools::Itertools;
use smallvec::{smallvec, SmallVec};

pub(crate) const KEY_SEP: &str = "/";
const TENSOR_META_NAME: &str = "tensor_meta.json";
const CHUNK_IDS_NAME: &str = "chunks_index";
const CHUNKS_DIR: &str = "chunks";

const KEY_SMALLVEC_SIZE: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum InvalidKey {
    #[error("Key component is empty")]
    Empty,
    #[error("Key component contains '/'")]
    HasSlash,
}

fn validate_component(s: &str) -> Result<(), InvalidKey> {
    if s.is_empty() {
        return Err(InvalidKey::Empty);
    }
    if s.contains(KEY_SEP) {
        return Err(InvalidKey::HasSlash);
    }
    Ok(())
}

/// Key addressing one object in a [Store](crate::store::Store).
///
/// All persistent tensor state lives under deterministic keys below the
/// tensor's own key `T`:
/// `T/tensor_meta.json`, `T/chunks_index`, and `T/chunks/<hex-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(SmallVec<[String; KEY_SMALLVEC_SIZE]>);

impl ObjectKey {
    pub fn new<I, T>(components: I) -> Result<Self, InvalidKey>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut out: SmallVec<[String; KEY_SMALLVEC_SIZE]> = SmallVec::new();
        for c in components {
            let c = c.into();
            validate_component(&c)?;
            out.push(c);
        }
        Ok(Self(out))
    }

    /// Key of the tensor meta blob for tensor `tensor`.
    pub fn tensor_meta(tensor: &str) -> Self {
        Self(smallvec![tensor.to_owned(), TENSOR_META_NAME.to_owned()])
    }

    /// Key of the chunk id encoder blob for tensor `tensor`.
    pub fn chunk_id_encoder(tensor: &str) -> Self {
        Self(smallvec![tensor.to_owned(), CHUNK_IDS_NAME.to_owned()])
    }

    /// Key of one chunk blob, by its stable name.
    pub fn chunk(tensor: &str, chunk_name: &str) -> Self {
        Self(smallvec![
            tensor.to_owned(),
            CHUNKS_DIR.to_owned(),
            chunk_name.to_owned(),
        ])
    }

    /// Prefix under which all of a tensor's objects live.
    pub fn tensor_prefix(tensor: &str) -> Self {
        Self(smallvec![tensor.to_owned()])
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, component: String) -> Result<(), InvalidKey> {
        validate_component(&component)?;
        self.0.push(component);
        Ok(())
    }

    /// Whether the key addresses a chunk blob (as opposed to metadata).
    pub fn is_chunk(&self) -> bool {
        self.0.len() >= 2 && self.0[self.0.len() - 2] == CHUNKS_DIR
    }

    /// Check whether this key starts with (or equals) the other key.
    pub fn starts_with(&self, other: &ObjectKey) -> bool {
        self.len() >= other.len() && self.0[..other.len()] == other.0[..]
    }

    /// Encode the key as a string by joining its parts with `/`.
    pub fn encode(&self) -> String {
        self.0.iter().join(KEY_SEP)
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ObjectKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.split(KEY_SEP))
    }
}
