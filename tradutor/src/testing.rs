//! Helpers for testing code built on `tradutor`.
//!
//! The store and queue conformance suites live in [`crate::store_test_suite`] and
//! [`crate::queue_test_suite`].
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;

use crate::translator::{TranslateError, Translator};

type Respond = dyn Fn(&str, &str, &str) -> Result<String, TranslateError> + Send + Sync;

/// A [`Translator`] that answers from a closure and counts how often it was called.
///
/// Clones share the call count.
///
/// # Example
///
/// ```
/// # use tradutor::testing::ScriptedTranslator;
/// # use tradutor::translator::Translator;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let translator = ScriptedTranslator::echo();
///
/// let text = translator.translate("Hello", "en", "pt").await.unwrap();
///
/// assert_eq!(text, "[pt] Hello");
/// assert_eq!(translator.calls(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct ScriptedTranslator {
    respond: Arc<Respond>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedTranslator {
    pub fn new(
        respond: impl Fn(&str, &str, &str) -> Result<String, TranslateError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Arc::new(respond),
            calls: Default::default(),
        }
    }

    /// Answers `"[<target>] <text>"`.
    pub fn echo() -> Self {
        Self::new(|text, _, target| Ok(format!("[{target}] {text}")))
    }

    /// Always fails with [`TranslateError::Provider`].
    pub fn failing(message: &str) -> Self {
        let message = message.to_owned();
        Self::new(move |_, _, _| Err(TranslateError::Provider(message.clone())))
    }

    /// The number of calls made so far, across all clones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for ScriptedTranslator {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(text, source_language, target_language)
    }
}
