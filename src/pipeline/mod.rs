//! Pipeline stages for archive-to-PDF conversion.
//!
//! Each submodule implements one step. The orchestrator strings them
//! together per archive and persists a flag after each of the three
//! resumable stages (`pdf`, `ocr`, `llm`).
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ dedup ──▶ render ──▶ merge ──▶ ocr ──▶ recompress
//! (zip)     (sha256)  (chrome)   (lopdf)   (ocrmypdf) (gs)
//! └──────────────── pdf stage ───────────┘  ocr stage  llm stage
//! ```
//!
//! 1. [`input`]  : find `*.zip` archives, unpack one into a temp workspace
//! 2. [`dedup`]  : hash page documents, keep the first of each distinct page
//! 3. [`render`] : worker pool, one renderer per worker; page size from
//!    [`dimensions`], renderer from [`chrome`]
//! 4. [`merge`]  : chunked merge of page artifacts in ordinal order
//! 5. [`ocr`]    : drive the OCR service with phase tracking and heartbeats
//! 6. [`recompress`] : shrink searchable PDFs, in parallel batches when many
//!
//! [`tools`] checks the external programs before anything runs.

pub mod chrome;
pub mod dedup;
pub mod dimensions;
pub mod input;
pub mod merge;
pub mod ocr;
pub mod recompress;
pub mod render;
pub mod tools;
