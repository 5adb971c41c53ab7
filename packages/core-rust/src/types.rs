use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::status::Status;

/// Generic runtime value used for extensible per-call options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Uses `BTreeMap` for deterministic serialization order.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the integer payload, if this is an `Int`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// A message type that can travel inside a [`Payload`].
///
/// The type URL identifies the message on the wire so that a payload is never
/// decoded as the wrong type.
pub trait TypedMessage: Serialize + DeserializeOwned {
    const TYPE_URL: &'static str;
}

/// Errors from decoding a [`Payload`] into a concrete message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("malformed payload: {0}")]
    Malformed(#[from] rmp_serde::decode::Error),
}

/// Errors from encoding a message into a [`Payload`].
#[derive(Debug, thiserror::Error)]
#[error("payload encoding failed: {0}")]
pub struct EncodeError(#[from] rmp_serde::encode::Error);

/// Opaque typed blob: a type URL plus the MsgPack-encoded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub type_url: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl Payload {
    /// Encodes `message` under its type URL.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the message cannot be serialized.
    pub fn pack<M: TypedMessage>(message: &M) -> Result<Self, EncodeError> {
        Ok(Self {
            type_url: M::TYPE_URL.to_string(),
            value: rmp_serde::to_vec_named(message)?,
        })
    }

    /// Returns `true` if this payload carries an `M`.
    #[must_use]
    pub fn is<M: TypedMessage>(&self) -> bool {
        self.type_url == M::TYPE_URL
    }

    /// Decodes the payload as an `M`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::TypeMismatch`] if the payload carries a different
    /// type, or [`DecodeError::Malformed`] if the bytes do not decode.
    pub fn unpack<M: TypedMessage>(&self) -> Result<M, DecodeError> {
        if !self.is::<M>() {
            return Err(DecodeError::TypeMismatch {
                expected: M::TYPE_URL,
                found: self.type_url.clone(),
            });
        }
        Ok(rmp_serde::from_slice(&self.value)?)
    }
}

/// Terminal outcome of a finished long-running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Response(Payload),
    Error(Status),
}

/// Snapshot of a server-side long-running operation.
///
/// The name is assigned by the server and is stable once non-empty; it is the
/// only handle needed to resume tracking the operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    pub metadata: Option<Payload>,
    pub result: Option<OperationResult>,
}

impl Operation {
    /// An in-flight operation with no metadata.
    #[must_use]
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Marks the operation done with the given outcome.
    #[must_use]
    pub fn finished(mut self, result: OperationResult) -> Self {
        self.done = true;
        self.result = Some(result);
        self
    }

    /// The response payload, if the operation finished successfully.
    #[must_use]
    pub fn response(&self) -> Option<&Payload> {
        match &self.result {
            Some(OperationResult::Response(payload)) => Some(payload),
            _ => None,
        }
    }

    /// Decodes the metadata as `M`, treating absence and decode failures alike.
    #[must_use]
    pub fn metadata_as<M: TypedMessage>(&self) -> Option<M> {
        let payload = self.metadata.as_ref()?;
        match payload.unpack::<M>() {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::debug!(operation = %self.name, error = %e, "ignoring undecodable metadata");
                None
            }
        }
    }

    /// Decodes the response as `M`, treating absence and decode failures alike.
    #[must_use]
    pub fn response_as<M: TypedMessage>(&self) -> Option<M> {
        let payload = self.response()?;
        match payload.unpack::<M>() {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::debug!(operation = %self.name, error = %e, "ignoring undecodable response");
                None
            }
        }
    }
}

/// One page of a paginated operation listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationPage {
    pub operations: Vec<Operation>,
    /// Cursor for the next page; `None` on the last page.
    pub next_page_token: Option<String>,
}

impl OperationPage {
    #[must_use]
    pub fn last(operations: Vec<Operation>) -> Self {
        Self {
            operations,
            next_page_token: None,
        }
    }

    #[must_use]
    pub fn with_next(operations: Vec<Operation>, token: impl Into<String>) -> Self {
        Self {
            operations,
            next_page_token: Some(token.into()),
        }
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next_page_token.is_none()
    }
}
