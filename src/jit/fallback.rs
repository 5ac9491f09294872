//! The fallback interpreter
//!
//! Used whenever a specialization decision is not ready yet: it resumes
//! anywhere in the top frame, runs to the next merge point (or return) without
//! specializing anything, and feeds every split and promotion it passes into
//! the hotness counters.

use std::sync::Arc;
use tracing::{error, trace};

use super::hotness::{HotnessCounters, Profiler};
use super::install::CodeCache;
use super::JitConfig;
use crate::bytecode::{Location, Program};
use crate::error::{Error, Result};
use crate::runtime::{Bindings, Capabilities, Effects, Exit, Interpreter};

#[derive(Debug, Clone)]
pub struct FallbackInterpreter {
    interpreter: Interpreter,
}

impl FallbackInterpreter {
    pub fn new(program: Arc<Program>, config: &JitConfig) -> Self {
        Self {
            interpreter: Interpreter::new(program)
                .with_max_call_depth(config.max_call_depth)
                .with_loop_headers_only(config.loop_headers_only),
        }
    }

    /// Restrict what the fallback interpreter can execute
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.interpreter = self.interpreter.with_capabilities(capabilities);
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        self.interpreter.capabilities()
    }

    /// Run from `location` to the next merge point
    ///
    /// Promotion values are also recorded with `cache`, which decides when a
    /// site has seen too many of them.
    ///
    /// A capability gap is returned as [`Error::FallbackGap`]; it means the
    /// fallback interpreter cannot execute something the specializer can
    /// express, and the caller must stop specializing.
    pub fn resume(
        &self,
        location: Location,
        bindings: Bindings,
        effects: &mut Effects,
        counters: &mut HotnessCounters,
        cache: &CodeCache,
    ) -> Result<Exit> {
        trace!(at = %location, "fallback segment");
        counters.begin_segment();
        let result = self
            .interpreter
            .resume(location, bindings, effects, &mut Profiler::new(counters, cache));
        counters.end_segment();

        if let Err(Error::FallbackGap { location, message }) = &result {
            error!(at = %location, %message, "fallback interpreter cannot continue");
        }
        result
    }
}
