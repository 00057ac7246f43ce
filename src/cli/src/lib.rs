//! rootmerge CLI - merge rootfs directories into OCI image layers.

pub mod commands;
