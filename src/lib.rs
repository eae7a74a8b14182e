//! lbsync - nginx load balancer configuration synthesizer
//!
//! This library derives reverse-proxy configuration from load-balancer
//! bindings kept in a relational store and live Kubernetes topology:
//! - Resolves backends from pod endpoints or ready node ports
//! - Prepends a percentage-based canary prefix of a flow service's backends
//! - Renders upstream and vhost blocks, honoring operator-owned overrides
//! - Emits each shared certificate once per run
//! - Publishes one batch of config maps per cluster, or patches a single upstream

pub mod canary;
pub mod certs;
pub mod config;
pub mod db;
pub mod error;
pub mod kube_client;
pub mod orchestrator;
pub mod overrides;
pub mod publish;
pub mod render;
pub mod sync;
pub mod template;
pub mod topology;
