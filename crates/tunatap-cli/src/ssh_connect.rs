//! Wires `tunatap_core::supervisor::StandardConnectFactory` to the real
//! `russh`-backed `SshClient`, so `main` never has to depend on `tunatap_core::ssh`
//! directly — only on the factory seam the supervisor already tests against.

use std::sync::Arc;
use tunatap_core::hostkeys::HostKeyStore;
use tunatap_core::ssh::SshClient;
use tunatap_core::supervisor::{StandardConnectFactory, StandardDialParams};

pub fn standard_connect_factory(host_keys: Arc<HostKeyStore>) -> StandardConnectFactory<SshClient> {
    Arc::new(move |params: StandardDialParams| {
        let host_keys = host_keys.clone();
        Box::pin(async move {
            let spec = tunatap_core::ssh::DialSpec {
                bastion_host: params.bastion_host,
                user: params.user,
                credential: params.credential,
                socks_proxy: params.socks_proxy,
                keepalive_interval: params.keepalive_interval,
            };
            SshClient::connect(spec, host_keys).await.map_err(anyhow::Error::from)
        })
    })
}
