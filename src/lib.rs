// src/lib.rs

// 1. Data Structures (The "Nouns")
// explicit 'pub' makes them available to main.rs
pub mod models;
pub mod error;

// 2. Interfaces (The "Contract")
pub mod traits;

// 3. Filter Language (The "Grammar")
pub mod query;

// 4. Offer Discovery (The "Catalog")
pub mod catalog;

// 5. Adapters (The "Plumbing")
pub mod connectors;

// 6. Negotiation & Transfer (The "Orchestrator")
pub mod engine;

// 7. Local Storage (The "Workspace")
pub mod workspace;

// 8. Settings
pub mod config;
