// Copyright (c) 2025 RustySync Contributors
//
// Crate error type

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("skip list height {requested} outside supported range [1, {cap}]")]
    InvalidHeight { requested: usize, cap: usize },

    #[error("left sentinel must order strictly below right sentinel")]
    SentinelOrder,
}
