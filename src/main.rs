//! # virt-operator
//!
//! Kubernetes operator that installs, upgrades and removes a virtualization
//! control plane described by a `KubeVirt` resource.
//!
//! ## Overview
//!
//! 1. **Install strategy** - Loads the rendered manifests for the requested version and registry
//! 2. **Object sync** - Creates, patches and prunes every object the strategy names
//! 3. **Certificates** - Issues and rotates the CA and serving certificates
//! 4. **Node daemonset canary** - Rolls the node agent out one pod first, then wider
//! 5. **Lifecycle** - Reports conditions and removes everything when the resource is deleted
//!
//! Metrics and health endpoints are served on `METRICS_PORT` (default 8443).

use anyhow::Result;
use virt_operator::runtime::initialization::initialize;
use virt_operator::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init_result = initialize().await?;
    run_watch_loop(init_result).await
}
