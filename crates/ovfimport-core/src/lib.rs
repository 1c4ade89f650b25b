//! ovfimport Core Library
//!
//! This crate imports OVF/OVA virtual appliance packages onto a
//! virtualization platform.
//!
//! # Overview
//!
//! A package (a descriptor file, a directory or a TAR archive) is read,
//! resolved into deployment options, turned into a platform import spec and
//! uploaded through a transfer session. The main entry point is
//! [`Importer::import`]; [`Deployer::deploy`] runs the optional post-deploy
//! steps on the created VM.
//!
//! The platform itself sits behind the traits in [`platform`]. The [`sim`]
//! module provides an in-memory implementation.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`config`] - Per-invocation configuration
//! - [`cancel`] - Operator cancellation
//! - [`package`] - Package member access (files, TAR, gzip TAR)
//! - [`ovf`] - Descriptor model and OVF environment documents
//! - [`manifest`] - Manifest parsing and checksum verification
//! - [`options`] - Deployment options resolution and interchange
//! - [`import_spec`] - Network mapping and import spec construction
//! - [`session`] - Transfer session state machine
//! - [`lease`] - NFC lease uploads
//! - [`library`] - Content library update and download sessions
//! - [`importer`] - End-to-end import orchestration
//! - [`deploy`] - Post-deploy steps
//! - [`progress`] - Transfer progress reporting
//!
//! # Quick Start
//!
//! ```no_run
//! use ovfimport_core::sim::Simulator;
//! use ovfimport_core::{options, DeploymentOptions, Envelope, ImportConfig, Importer, Package, Target};
//! use std::path::Path;
//!
//! let platform = Simulator::new();
//! let mut package = Package::open(Path::new("/path/to/appliance.ova")).unwrap();
//!
//! let descriptor = package.read_descriptor().unwrap();
//! let envelope = Envelope::parse(&descriptor.text).unwrap();
//! let options: DeploymentOptions = options::resolve(&envelope, false, false);
//!
//! let importer = Importer::new(&platform, Target::default(), ImportConfig::verified());
//! importer.import(&mut package, &options).unwrap();
//! ```

pub mod cancel;
pub mod config;
pub mod deploy;
pub mod error;
pub mod import_spec;
pub mod importer;
pub mod lease;
pub mod library;
pub mod manifest;
pub mod options;
pub mod ovf;
pub mod package;
pub mod platform;
pub mod progress;
pub mod session;
pub mod sim;

pub use error::{Error, Result};

// Re-export the pipeline entry points for convenience
pub use cancel::CancelToken;
pub use config::{ImportConfig, PollPolicy};
pub use deploy::{DeployReport, Deployer, Step, StepOutcome};
pub use importer::{ImportOutcome, Importer, Target};
pub use library::{LibraryDownloader, LibraryUploader};
pub use manifest::{Manifest, ManifestPolicy};
pub use options::{DeploymentOptions, NetworkMapping, Overrides, Property};
pub use ovf::Envelope;
pub use package::Package;
pub use platform::{ManagedObjectRef, Platform};
pub use progress::{Progress, ProgressListener};
pub use session::{SessionState, TransferSession};
