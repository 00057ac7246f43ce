//! `rootmerge build` command: merge rootfses onto a base image.
//!
//! Copies the base image into an OCI layout, turns each group of rootfs
//! directories into one or more gzip layers, and appends them to the
//! tagged manifest.

use std::path::PathBuf;

use clap::Args;
use rootmerge_core::config::{BuildConfig, DEFAULT_IMPORTER, DEFAULT_OCI_DIR, DEFAULT_TAG};
use rootmerge_runtime::oci::build::{build, engine::format_size, read_rootfs_list};

#[derive(Args)]
pub struct BuildArgs {
    /// Base image reference understood by the importer (e.g., "docker://debian:bookworm")
    pub base_image: String,

    /// File listing one rootfs directory per line
    pub rootfs_list: PathBuf,

    /// Output OCI layout directory
    #[arg(long, default_value = DEFAULT_OCI_DIR)]
    pub oci_dir: PathBuf,

    /// Tag to read the base manifest from and write the result to
    #[arg(long, default_value = DEFAULT_TAG)]
    pub tag: String,

    /// Number of consecutive rootfses merged into one layer group
    #[arg(long, default_value_t = 1)]
    pub dirs_per_blob: usize,

    /// Build one group at a time
    #[arg(long, hide = true)]
    pub serialize: bool,

    /// Maximum compressed layer size in bytes (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    pub max_layer_size: u64,

    /// Tool used to copy the base image into the layout
    #[arg(long, default_value = DEFAULT_IMPORTER)]
    pub importer: String,

    /// Use the layout's existing content as the base image
    #[arg(long)]
    pub skip_import: bool,
}

impl BuildArgs {
    fn to_config(&self) -> BuildConfig {
        BuildConfig {
            oci_dir: self.oci_dir.clone(),
            tag: self.tag.clone(),
            dirs_per_blob: self.dirs_per_blob,
            serialize: self.serialize,
            max_layer_size: self.max_layer_size,
            importer: self.importer.clone(),
            skip_import: self.skip_import,
            ..Default::default()
        }
    }
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.to_config();
    config.validate()?;

    let rootfses = read_rootfs_list(&args.rootfs_list)?;
    tracing::debug!(
        rootfses = rootfses.len(),
        list = %args.rootfs_list.display(),
        "Read rootfs list"
    );

    let result = build(&config, &args.base_image, rootfses).await?;

    println!(
        "Appended {} layer(s) ({}) to {}:{}",
        result.layers_added,
        format_size(result.layers_size),
        config.oci_dir.display(),
        config.tag
    );
    println!("Manifest: {}", result.manifest_digest());
    for diff_id in &result.diff_ids {
        println!("  {}", diff_id);
    }

    Ok(())
}
