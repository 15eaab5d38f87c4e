use hickory_resolver::{config::ResolverConfig, lookup_ip::LookupIp};

use crate::error::{Error, Result};

/// An async runtime agnostic DNS resolver.
pub(crate) struct AsyncResolver {
    resolver: hickory_resolver::TokioAsyncResolver,
}

impl AsyncResolver {
    pub(crate) fn new(config: Option<ResolverConfig>) -> Result<Self> {
        let resolver = match config {
            Some(config) => hickory_resolver::TokioAsyncResolver::tokio(config, Default::default()),
            None => hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
                .map_err(Error::from_resolve_error)?,
        };

        Ok(Self { resolver })
    }

    pub(crate) async fn ip_lookup(&self, query: &str) -> Result<LookupIp> {
        let lookup = self
            .resolver
            .lookup_ip(query)
            .await
            .map_err(Error::from_resolve_error)?;
        Ok(lookup)
    }
}
