//! Prints the `KubeVirt` CustomResourceDefinition as YAML.
//!
//! ```sh
//! cargo run --bin crdgen > config/crd/kubevirt.yaml
//! ```

use kube::CustomResourceExt;
use virt_operator::KubeVirt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&KubeVirt::crd())?);
    Ok(())
}
