//! Corpus description: which sequence keys take part in reading, and the
//! mapping between sequence keys and numeric ids.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::RwLock;

use indexmap::IndexSet;
use tracing::debug;

use crate::constants::corpus::CARRIAGE_RETURN;
use crate::errors::{ReaderError, Result};
use crate::types::{SequenceId, SequenceKey};

/// Maps sequence keys to ids and decides which sequences are read.
///
/// In numeric-keys mode a key is its own id (parsed as an unsigned decimal
/// integer). In string-keys mode ids are handed out in first-seen order by an
/// append-only registry.
pub struct CorpusDescriptor {
    numeric_keys: bool,
    /// `None` includes every sequence.
    included: Option<HashSet<SequenceId>>,
    registry: RwLock<IndexSet<SequenceKey>>,
}

impl CorpusDescriptor {
    /// Corpus that includes every sequence.
    pub fn new(numeric_keys: bool) -> Self {
        Self {
            numeric_keys,
            included: None,
            registry: RwLock::new(IndexSet::new()),
        }
    }

    /// Corpus restricted to the keys listed in an inclusion file.
    pub fn from_file(path: impl AsRef<Path>, numeric_keys: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let corpus = Self::from_reader(BufReader::new(file), numeric_keys)?;
        debug!(
            path = %path.display(),
            included = corpus.included_len().unwrap_or_default(),
            "loaded corpus inclusion file"
        );
        Ok(corpus)
    }

    /// Corpus restricted to keys read one per line. CRLF endings are accepted
    /// and trailing blank lines are ignored.
    pub fn from_reader(reader: impl BufRead, numeric_keys: bool) -> Result<Self> {
        let mut keys = Vec::new();
        for line in reader.lines() {
            let mut line = line?;
            if line.ends_with(CARRIAGE_RETURN) {
                line.pop();
            }
            keys.push(line);
        }
        while keys.last().is_some_and(|key| key.is_empty()) {
            keys.pop();
        }
        Self::from_keys(keys, numeric_keys)
    }

    /// Corpus restricted to the given keys.
    pub fn from_keys(
        keys: impl IntoIterator<Item = SequenceKey>,
        numeric_keys: bool,
    ) -> Result<Self> {
        let mut corpus = Self::new(numeric_keys);
        let mut included = HashSet::new();
        for key in keys {
            included.insert(corpus.key_to_id(&key)?);
        }
        corpus.included = Some(included);
        Ok(corpus)
    }

    /// Returns `true` when keys are parsed as numbers rather than registered.
    pub fn numeric_keys(&self) -> bool {
        self.numeric_keys
    }

    /// Number of included ids, or `None` when every sequence is included.
    pub fn included_len(&self) -> Option<usize> {
        self.included.as_ref().map(HashSet::len)
    }

    /// Id of `key`, registering it in string-keys mode if it is new.
    pub fn key_to_id(&self, key: &str) -> Result<SequenceId> {
        if self.numeric_keys {
            return parse_numeric_key(key);
        }
        if let Some(id) = self.registered_id(key) {
            return Ok(id);
        }
        let mut registry = self.registry.write().expect("corpus registry poisoned");
        let (index, _) = registry.insert_full(key.to_string());
        Ok(index as SequenceId)
    }

    /// Key of `id`.
    pub fn id_to_key(&self, id: SequenceId) -> Result<SequenceKey> {
        if self.numeric_keys {
            return Ok(id.to_string());
        }
        let registry = self.registry.read().expect("corpus registry poisoned");
        usize::try_from(id)
            .ok()
            .and_then(|index| registry.get_index(index))
            .cloned()
            .ok_or(ReaderError::UnknownSequenceId { id })
    }

    /// Returns `true` when `key` takes part in reading.
    ///
    /// In string-keys mode a key that was never registered is not included,
    /// and checking does not register it.
    pub fn is_included(&self, key: &str) -> Result<bool> {
        let Some(included) = &self.included else {
            return Ok(true);
        };
        let id = if self.numeric_keys {
            parse_numeric_key(key)?
        } else {
            match self.registered_id(key) {
                Some(id) => id,
                None => return Ok(false),
            }
        };
        Ok(included.contains(&id))
    }

    fn registered_id(&self, key: &str) -> Option<SequenceId> {
        let registry = self.registry.read().expect("corpus registry poisoned");
        registry.get_index_of(key).map(|index| index as SequenceId)
    }
}

fn parse_numeric_key(key: &str) -> Result<SequenceId> {
    if key.is_empty() || !key.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ReaderError::InvalidKey {
            key: key.to_string(),
        });
    }
    key.parse().map_err(|_| ReaderError::InvalidKey {
        key: key.to_string(),
    })
}
