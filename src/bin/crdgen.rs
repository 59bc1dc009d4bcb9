//! Prints the `Terraform` CustomResourceDefinition as YAML.
//!
//! `crdgen | kubectl apply -f -`

use kube::CustomResourceExt;
use tf_controller::crd::Terraform;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Terraform::crd())?);
    Ok(())
}
