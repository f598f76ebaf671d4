//! Module containing error types used in Tempest

use std::fmt;
use std::io;

use err_derive::Error;

use crate::data::{BlockId, StorageLevel};

/// Regroup all errors used in Tempest
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] io::Error),

	#[error(display = "Messagepack encode error: {}", _0)]
	RmpEncode(#[error(source)] rmp_serde::encode::Error),
	#[error(display = "Messagepack decode error: {}", _0)]
	RmpDecode(#[error(source)] rmp_serde::decode::Error),

	#[error(display = "Config file syntax error: {}", _0)]
	TomlDecode(#[error(source)] toml::de::Error),

	#[error(display = "Tokio join error: {}", _0)]
	TokioJoin(#[error(source)] tokio::task::JoinError),

	#[error(display = "Block {} not found", _0)]
	BlockNotFound(BlockId),

	#[error(display = "Block {} could not be read back from local storage", _0)]
	CorruptBlock(BlockId),

	#[error(display = "Invalid storage level: {}", _0)]
	InvalidStorageLevel(StorageLevel),

	#[error(display = "Timeout")]
	Timeout,

	#[error(display = "Unexpected RPC message: {}", _0)]
	UnexpectedRpcMessage(String),

	#[error(display = "{}", _0)]
	Message(String),
}

impl Error {
	pub fn unexpected_rpc_message<T: fmt::Debug>(v: T) -> Self {
		Error::UnexpectedRpcMessage(format!("{:?}", v))
	}
}

impl From<tokio::sync::watch::error::SendError<bool>> for Error {
	fn from(_e: tokio::sync::watch::error::SendError<bool>) -> Error {
		Error::Message("Watch send error".into())
	}
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
	fn from(_e: tokio::sync::mpsc::error::SendError<T>) -> Error {
		Error::Message("MPSC send error".into())
	}
}

/// Trait to add context to errors
pub trait ErrorContext<T, E> {
	fn err_context<C: std::borrow::Borrow<str>>(self, ctx: C) -> Result<T, Error>;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
	E: std::fmt::Display,
{
	#[inline]
	fn err_context<C: std::borrow::Borrow<str>>(self, ctx: C) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}\n{}", ctx.borrow(), e)))
	}
}

/// Trait to map any error type to Error::Message
pub trait OkOrMessage {
	type S;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<Self::S, Error>;
}

impl<T, E> OkOrMessage for Result<T, E>
where
	E: std::fmt::Display,
{
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}: {}", message.into(), e)))
	}
}

impl<T> OkOrMessage for Option<T> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		self.ok_or_else(|| Error::Message(message.into()))
	}
}
