//! The reservation engine: validation and the per-operation protocol on top
//! of a [`Backend`]. Holds no mutable state of its own.

mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::{EngineError, ErrorKind};

use std::sync::Arc;

use crate::store::{Backend, LibraryStore};

pub struct Engine<B> {
    store: Arc<B>,
}

pub type LibraryEngine = Engine<LibraryStore>;

impl<B: Backend> Engine<B> {
    pub fn new(store: Arc<B>) -> Self {
        Self { store }
    }
}
