//! # Instance Builder
//!
//! Fluent configuration for a `RuntimeInstance`: which standard libraries to
//! open, how the Luau compiler is tuned, which type registry to draw
//! descriptors from, where script `print` output goes, and what application
//! data host callbacks can reach.

use std::sync::Arc;

use anymap::AnyMap;

use crate::context::CallFrame;
use crate::context::InstanceCtx;
use crate::descriptor::HostFunction;
use crate::dispatch;
use crate::instance::Error;
use crate::instance::Result;
use crate::instance::RuntimeInstance;
use crate::marshal;
use crate::registry::TypeRegistry;
use crate::stack::Stack;
use crate::value::Value;

/// Luau compiler settings, passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub optimization_level: u8,
    pub debug_level: u8,
    pub type_info_level: u8,
    pub coverage_level: u8,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { optimization_level: 1, debug_level: 1, type_info_level: 1, coverage_level: 0 }
    }
}

pub type PrintSink = Arc<dyn Fn(&str) + Send + Sync>;

fn trace_sink() -> PrintSink {
    Arc::new(|line| tracing::info!(target: "luaubind::script", "{}", line))
}

/// Fluent builder for creating runtime instances.
pub struct InstanceBuilder {
    open_libs: bool,
    options: CompileOptions,
    chunk_name: String,
    registry: Option<Arc<TypeRegistry>>,
    print: PrintSink,
    app_data: AnyMap,
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceBuilder {
    pub fn new() -> Self {
        Self {
            open_libs: true,
            options: CompileOptions::default(),
            chunk_name: "chunk".to_string(),
            registry: None,
            print: trace_sink(),
            app_data: AnyMap::new(),
        }
    }

    pub fn open_libs(mut self, open: bool) -> Self {
        self.open_libs = open;
        self
    }

    pub fn optimization_level(mut self, level: u8) -> Self {
        self.options.optimization_level = level;
        self
    }

    pub fn debug_level(mut self, level: u8) -> Self {
        self.options.debug_level = level;
        self
    }

    pub fn type_info_level(mut self, level: u8) -> Self {
        self.options.type_info_level = level;
        self
    }

    pub fn coverage_level(mut self, level: u8) -> Self {
        self.options.coverage_level = level;
        self
    }

    /// Name reported for loaded source in script error messages.
    pub fn chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    pub fn registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Redirects script `print` output. Arguments arrive joined by tabs.
    pub fn print(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.print = Arc::new(sink);
        self
    }

    /// Adds a typed value reachable from host callbacks via `CallContext::app_data`.
    pub fn app_data<T: 'static>(mut self, value: T) -> Self {
        self.app_data.insert(value);
        self
    }

    pub fn build(self) -> Result<RuntimeInstance> {
        let stack = Stack::open(self.open_libs).ok_or(Error::StateAllocation)?;
        let registry = self.registry.unwrap_or_else(TypeRegistry::global);
        let ctx = InstanceCtx::install(stack, registry, self.app_data);
        dispatch::install_callable_metatable(&ctx, stack);

        let sink = self.print;
        let print = HostFunction::variadic("print", move |_, frame: &CallFrame| {
            let line: Vec<String> = frame.iter().map(render).collect();
            sink(&line.join("\t"));
            Ok(Value::Nil)
        });
        marshal::push(&ctx, stack, &Value::Closure(print))?;
        stack.set_global("print");

        tracing::debug!(instance = %ctx.id(), open_libs = self.open_libs, "created runtime instance");
        Ok(RuntimeInstance::new(ctx, self.options, self.chunk_name))
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        other => other.to_text().unwrap_or_default(),
    }
}
