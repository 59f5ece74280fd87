//! Compiler configuration.

use crate::bytecode::CollectionBits;

/// Default limit on syntactic nesting (parentheses, nested blocks, nested scopes).
///
/// Lower in debug builds, which use considerably more stack per recursive frame.
#[cfg(not(debug_assertions))]
pub const DEFAULT_MAX_NESTING_DEPTH: u16 = 200;
/// Default limit on syntactic nesting (parentheses, nested blocks, nested scopes).
#[cfg(debug_assertions)]
pub const DEFAULT_MAX_NESTING_DEPTH: u16 = 35;

/// Options controlling a single compilation.
///
/// Build with the builder methods:
///
/// ```
/// use tessera::CompileOptions;
///
/// let options = CompileOptions::new().filename("main.py").optimize(true);
/// assert_eq!(options.get_filename(), "main.py");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompileOptions {
    filename: String,
    max_nesting_depth: u16,
    collection_batch_size: u8,
    optimize: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            filename: "<module>".to_owned(),
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            collection_batch_size: max_batch_size(),
            optimize: false,
        }
    }
}

impl CompileOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filename recorded in every produced code unit.
    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Sets the nesting limit after which compilation fails with a resource-limit error.
    #[must_use]
    pub fn max_nesting_depth(mut self, depth: u16) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    /// Caps how many stack items a collection literal accumulates before flushing.
    ///
    /// Clamped to `1..=31`; 31 is the most a single collection instruction can carry.
    #[must_use]
    pub fn collection_batch_size(mut self, size: u8) -> Self {
        self.collection_batch_size = size.clamp(1, max_batch_size());
        self
    }

    /// Drops `assert` statements when set.
    #[must_use]
    pub fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    #[must_use]
    pub fn get_filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn get_max_nesting_depth(&self) -> u16 {
        self.max_nesting_depth
    }

    #[must_use]
    pub fn get_collection_batch_size(&self) -> u8 {
        self.collection_batch_size
    }

    #[must_use]
    pub fn is_optimized(&self) -> bool {
        self.optimize
    }
}

fn max_batch_size() -> u8 {
    // COUNT_MASK is 31
    CollectionBits::MAX_STACK_ELEMENT_COUNT.to_le_bytes()[0]
}
