#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod balancer;
pub mod error;
mod metrics;
pub mod options;
mod pool;
pub(crate) mod runtime;
mod session;
#[cfg(feature = "sync")]
pub mod sync;

pub use crate::{
    balancer::LoadBalancer,
    error::{Error, ErrorKind, Result},
    options::{
        ConnectionString,
        LoadBalancePolicy,
        PoolSettings,
        Protocol,
        ServerRedirectionMode,
        TlsMode,
        TlsOptions,
    },
    pool::{
        registry::{PoolRegistry, ShutdownHook},
        ConnectionPool,
        ProcedureCache,
    },
    session::{PooledSession, ServerSession, SessionHealth},
};
