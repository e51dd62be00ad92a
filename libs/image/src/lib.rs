//! Container images for casnap.
//!
//! - [`reference`]: image names, including `tarball:` sources and credentials
//! - [`oci`]: registry client (pull manifests and blobs, push seeds)
//! - [`tarball`]: `docker save` archives
//! - [`unpack`]: layer extraction into overlay lower directories
//! - [`seed`]: the one-layer images that name a converted image's chunk index

pub mod auth;
pub mod digest;
pub mod error;
pub mod image;
pub mod manifest;
pub mod oci;
pub mod reference;
pub mod seed;
pub mod tarball;
pub mod unpack;

pub use digest::Digest;
pub use error::{ImageError, OciError};
pub use image::{inspect, pull, pull_from_registry, Image, Layer, RemoteImage};
pub use manifest::{Descriptor, ImageConfig, Manifest, Platform};
pub use oci::{OciClient, OciConfig};
pub use reference::{
    parse_image_name, parse_image_ref, Authenticator, ImageSource, Reference, RegistryRef,
};
pub use seed::{build_seed, pull_seed, push_seed, SeedImage};
pub use unpack::unpack_layer;
