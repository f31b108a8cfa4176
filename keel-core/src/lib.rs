//! keel-core - converge cloud resources, provision identity registrations
//! and manage SSH credentials for a self-hosted deployment.
//!
//! ## Architecture
//!
//! - **Reconciler**: get-or-create with operator-mediated drift handling for
//!   firewalls, compute instances and SSH public keys
//! - **Orchestrator**: ordered provisioning steps with LIFO compensation on
//!   failure, used for the identity provider workflow
//! - **Credential**: vault- or file-backed SSH key material and secrets,
//!   resolved once per process
//!
//! Providers are reached through the `hcloud`, `az` and `op` command line
//! tools behind traits in [`clients`], so every component can be driven by
//! in-memory fakes.
//!
//! # Example
//! ```ignore
//! use keel_core::clients::HcloudClient;
//! use keel_core::reconciler::ResourceReconciler;
//!
//! let reconciler = ResourceReconciler::new(Arc::new(HcloudClient::new("hcloud")), operator);
//! let outcome = reconciler.reconcile(&config.firewall_spec().unwrap()).await;
//! ```

pub mod audit;
pub mod clients;
pub mod config;
pub mod credential;
pub mod error;
pub mod keys;
pub mod operator;
pub mod orchestrator;
pub mod poll;
pub mod reconciler;
pub mod resource;
pub mod ssh_config;

pub use error::{ProvisionError, Result};
