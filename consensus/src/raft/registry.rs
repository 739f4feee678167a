//! Payload type table
//! Maps the tag byte of a log entry command to its kind. Built once at
//! startup and shared with the codec.

use std::collections::BTreeMap;

use crate::error::CodecError;

pub const NOOP_TAG: u8 = 0;
pub const CLUSTER_CONFIG_TAG: u8 = 1;
/// First tag available to applications.
pub const FIRST_APPLICATION_TAG: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Noop,
    ClusterConfig,
    Application(&'static str),
}

#[derive(Debug, Clone)]
pub struct PayloadRegistry {
    kinds: BTreeMap<u8, PayloadKind>,
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadRegistry {
    /// Registry holding only the reserved kinds.
    pub fn new() -> Self {
        let mut kinds = BTreeMap::new();
        kinds.insert(NOOP_TAG, PayloadKind::Noop);
        kinds.insert(CLUSTER_CONFIG_TAG, PayloadKind::ClusterConfig);
        PayloadRegistry { kinds }
    }

    pub fn register(&mut self, tag: u8, name: &'static str) -> Result<(), CodecError> {
        if tag < FIRST_APPLICATION_TAG {
            return Err(CodecError::ReservedPayloadType(tag));
        }
        if self.kinds.contains_key(&tag) {
            return Err(CodecError::DuplicatePayloadType(tag));
        }
        self.kinds.insert(tag, PayloadKind::Application(name));
        Ok(())
    }

    /// Builder-style registration for startup code.
    pub fn with(mut self, tag: u8, name: &'static str) -> Result<Self, CodecError> {
        self.register(tag, name)?;
        Ok(self)
    }

    pub fn lookup(&self, tag: u8) -> Result<PayloadKind, CodecError> {
        self.kinds
            .get(&tag)
            .copied()
            .ok_or(CodecError::UnknownPayloadType(tag))
    }
}
