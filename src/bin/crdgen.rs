use extension_controller::crd::{Cluster, Extension};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Extension::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Cluster::crd())?);
    Ok(())
}
