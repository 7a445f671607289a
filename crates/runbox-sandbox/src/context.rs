//! Capability context: the complete set of globals a script can reach.
//!
//! A context is built fresh for every run and consumed by it. Installing it
//! into a new runtime exposes `console`, `require` (restricted to an
//! allow-list), timers, and `Buffer`, then removes the `Deno` namespace so the
//! script has no path to host capabilities other than those listed here.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use deno_core::JsRuntime;

use crate::error::SandboxError;
use crate::modules::{BUFFER_SOURCE, CRYPTO_SOURCE, PATH_SOURCE, UTIL_SOURCE};
use crate::ops::{CapturedLog, FailureSlot, TimerRegistry};

/// Name of the error class thrown when a script requires a disallowed module.
pub const CAPABILITY_DENIED_ERROR: &str = "CapabilityDeniedError";

/// A module a script may load with `require`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllowedModule {
    /// POSIX path helpers.
    Path,
    /// Formatting and small helpers.
    Util,
    /// Hashing, HMAC, and randomness.
    Crypto,
}

impl AllowedModule {
    /// Every module the sandbox knows how to provide.
    pub const ALL: [AllowedModule; 3] = [Self::Path, Self::Util, Self::Crypto];

    /// The name scripts pass to `require`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Util => "util",
            Self::Crypto => "crypto",
        }
    }

    fn factory(self) -> &'static str {
        match self {
            Self::Path => PATH_SOURCE,
            Self::Util => UTIL_SOURCE,
            Self::Crypto => CRYPTO_SOURCE,
        }
    }
}

impl fmt::Display for AllowedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllowedModule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("node:").unwrap_or(s) {
            "path" => Ok(Self::Path),
            "util" => Ok(Self::Util),
            "crypto" => Ok(Self::Crypto),
            other => Err(format!("unknown module '{other}'")),
        }
    }
}

/// Builds a [`CapabilityContext`] for one run.
#[derive(Debug, Clone)]
pub struct CapabilityContextBuilder {
    modules: BTreeSet<AllowedModule>,
    max_output_bytes: usize,
}

impl Default for CapabilityContextBuilder {
    fn default() -> Self {
        Self {
            modules: AllowedModule::ALL.into_iter().collect(),
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl CapabilityContextBuilder {
    /// A builder allowing `path`, `util`, and `crypto` with a 1 MiB output cap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the module allow-list.
    pub fn allow_modules(mut self, modules: impl IntoIterator<Item = AllowedModule>) -> Self {
        self.modules = modules.into_iter().collect();
        self
    }

    /// Cap the total size of captured output.
    pub fn max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// The current allow-list.
    pub fn allowed_modules(&self) -> impl Iterator<Item = AllowedModule> + '_ {
        self.modules.iter().copied()
    }

    /// Produce a fresh context with an empty log buffer.
    pub fn build(&self) -> CapabilityContext {
        CapabilityContext {
            modules: self.modules.clone(),
            max_output_bytes: self.max_output_bytes,
        }
    }
}

/// The capabilities granted to exactly one run.
///
/// Not `Clone`: each run consumes its own context, so no log buffer or module
/// cache is ever shared between runs.
#[derive(Debug)]
pub struct CapabilityContext {
    modules: BTreeSet<AllowedModule>,
    max_output_bytes: usize,
}

impl CapabilityContext {
    /// Whether `require(name)` would succeed.
    pub fn allows(&self, name: &str) -> bool {
        name.parse::<AllowedModule>()
            .map(|m| self.modules.contains(&m))
            .unwrap_or(false)
    }

    /// Output cap in bytes.
    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Install the context's state and globals into a fresh runtime.
    pub(crate) fn install(self, runtime: &mut JsRuntime) -> Result<(), SandboxError> {
        {
            let state = runtime.op_state();
            let mut state = state.borrow_mut();
            state.put(CapturedLog::new(self.max_output_bytes));
            state.put(FailureSlot::default());
            state.put(TimerRegistry::default());
        }

        let bootstrap = self.bootstrap_source();
        runtime
            .execute_script("[runbox:bootstrap]", bootstrap)
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {e}"))
            })?;
        Ok(())
    }

    fn bootstrap_source(&self) -> String {
        let factories = self
            .modules
            .iter()
            .map(|m| format!("        {}: {},", m.as_str(), m.factory().trim()))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"((ops, indirectEval) => {{
    const timers = new Map();
    let nextTimerId = 1;
    let failed = false;

    const cancelAllTimers = () => {{
        for (const id of [...timers.keys()]) {{
            timers.delete(id);
            ops.op_runbox_timer_cancel(id);
        }}
    }};

    const fail = (e) => {{
        const name = (e && typeof e === 'object' && typeof e.name === 'string') ? e.name : 'Error';
        const message = (e && e.message) || String(e);
        failed = true;
        ops.op_runbox_fail(name, String(message));
        cancelAllTimers();
    }};

    const formatArg = (arg) => {{
        if (typeof arg === 'object' && arg !== null) {{
            try {{
                const json = JSON.stringify(arg);
                return json === undefined ? String(arg) : json;
            }} catch (_) {{
                return String(arg);
            }}
        }}
        return String(arg);
    }};
    const emit = (level) => (...args) => {{
        ops.op_runbox_log(level, args.map(formatArg).join(' '));
    }};
    globalThis.console = Object.freeze({{
        log: emit('log'),
        error: emit('error'),
        warn: emit('warn'),
    }});

    const schedule = (callback, delay, args, repeat) => {{
        if (typeof callback !== 'function') {{
            throw new TypeError('The "callback" argument must be of type function');
        }}
        const id = nextTimerId++;
        const ms = Math.min(2147483647, Math.max(repeat ? 1 : 0, Math.trunc(Number(delay)) || 0));
        timers.set(id, true);
        const tick = () => {{
            ops.op_runbox_timer_wait(id, ms).then((fired) => {{
                if (!fired || failed || !timers.has(id)) return;
                if (!repeat) timers.delete(id);
                try {{
                    callback(...args);
                }} catch (e) {{
                    fail(e);
                    return;
                }}
                if (repeat && timers.has(id)) tick();
            }});
        }};
        tick();
        return id;
    }};
    const clear = (id) => {{
        if (timers.delete(id)) ops.op_runbox_timer_cancel(id);
    }};
    globalThis.setTimeout = (cb, delay, ...args) => schedule(cb, delay, args, false);
    globalThis.setInterval = (cb, delay, ...args) => schedule(cb, delay, args, true);
    globalThis.setImmediate = (cb, ...args) => schedule(cb, 0, args, false);
    globalThis.clearTimeout = clear;
    globalThis.clearInterval = clear;
    globalThis.clearImmediate = clear;
    globalThis.queueMicrotask = (cb) => {{
        Promise.resolve().then(() => {{
            try {{ cb(); }} catch (e) {{ fail(e); }}
        }});
    }};

    const Buffer = {buffer}(ops);
    globalThis.Buffer = Buffer;

    class CapabilityDeniedError extends Error {{
        constructor(message) {{
            super(message);
            this.name = '{denied}';
        }}
    }}

    const factories = {{
{factories}
    }};
    const cache = new Map();
    globalThis.require = (name) => {{
        const key = String(name).replace(/^node:/, '');
        if (!Object.prototype.hasOwnProperty.call(factories, key)) {{
            throw new CapabilityDeniedError(`Module '${{name}}' is not allowed`);
        }}
        if (!cache.has(key)) cache.set(key, factories[key](ops, Buffer));
        return cache.get(key);
    }};

    Object.defineProperty(globalThis, '__runboxRun', {{
        value: (source) => {{
            try {{
                indirectEval(source);
            }} catch (e) {{
                fail(e);
            }}
        }},
        configurable: true,
        enumerable: false,
        writable: false,
    }});

    delete globalThis.Deno;
    delete globalThis.__bootstrap;
}})(Deno.core.ops, globalThis.eval);"#,
            buffer = BUFFER_SOURCE.trim(),
            denied = CAPABILITY_DENIED_ERROR,
            factories = factories,
        )
    }
}

/// The script invocation: hands `source` to the runner installed by the
/// bootstrap and removes the runner before the script can see it.
pub(crate) fn invocation_source(source: &str) -> Result<String, SandboxError> {
    let literal = serde_json::to_string(source)
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("encoding script failed: {e}")))?;
    Ok(format!(
        "((run) => {{ delete globalThis.__runboxRun; run({literal}); }})(globalThis.__runboxRun);"
    ))
}
