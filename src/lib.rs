// Configuration loading and validation
pub mod config;

// Encrypted credential store, file lock, atomic persistence
pub mod credentials;

// Single-use TTL registries for OAuth states and codes
pub mod ephemeral;

// Bearer extraction and backend session tokens
pub mod auth;

// Provider OAuth and resource API client
pub mod provider;

// Two-hop OAuth orchestration
pub mod bridge;

// Per-client request throttling
pub mod rate_limit;

// HTTP API
pub mod api;
