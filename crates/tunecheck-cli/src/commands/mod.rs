//! CLI commands

use std::path::Path;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tunecheck_common::config::{resolve_kubeconfig, SuiteConfig};
use tunecheck_common::kube_utils::create_client;

use crate::{GlobalArgs, Result};

pub mod metallb;
pub mod power;

/// Load the suite configuration and connect to the cluster under test
pub async fn connect(global: &GlobalArgs) -> Result<(SuiteConfig, Client)> {
    let config = SuiteConfig::load(global.config.as_deref())?;
    let kubeconfig = resolve_kubeconfig(global.kubeconfig.as_deref());
    if let Some(path) = &kubeconfig {
        info!(kubeconfig = %path, "Using kubeconfig");
    }
    let client = create_client(kubeconfig.as_deref().map(Path::new)).await?;
    Ok((config, client))
}

/// Token cancelled on the first Ctrl-C
pub fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting the running scenario and restoring configuration");
            cancel.cancel();
        }
    });
    token
}
