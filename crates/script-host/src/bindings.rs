//! Host API bindings for JavaScript
//!
//! The sandbox gets exactly one native function, `__host_call(name, argsJson)`,
//! which answers with a JSON envelope. [`RUNTIME_PRELUDE`] builds the script
//! globals on top of it and then removes it from `globalThis`, so every global
//! maps onto one registry call with only argument coercion and result shaping.

use std::sync::Arc;

use hostbridge_protocol::OperationKind;
use rquickjs::function::Func;
use rquickjs::Ctx;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::registry::{envelope, HostOps, OpCall};
use crate::runtime::CancellationToken;
use crate::{BridgeError, ScriptError};

/// Bridge between the synchronous sandbox thread and async host operations
#[derive(Clone)]
pub struct HostApi {
    ops: Arc<dyn HostOps>,
    handle: Handle,
    cancellation: CancellationToken,
}

impl HostApi {
    pub fn new(ops: Arc<dyn HostOps>, handle: Handle, cancellation: CancellationToken) -> Self {
        Self {
            ops,
            handle,
            cancellation,
        }
    }

    /// Run one operation and render its envelope
    ///
    /// Must be called from a thread outside the async runtime (the sandbox
    /// runs on a blocking worker).
    pub fn call(&self, name: &str, args_json: &str) -> String {
        envelope(self.dispatch(name, args_json)).to_string()
    }

    fn dispatch(&self, name: &str, args_json: &str) -> Result<Value, BridgeError> {
        let args: Value = serde_json::from_str(args_json)
            .map_err(|e| BridgeError::invalid(name, format!("arguments are not JSON: {e}")))?;
        let call = OpCall::parse(name, &args)?;

        if call.operation().kind() != OperationKind::Suspending {
            return self.handle.block_on(self.ops.invoke(call));
        }

        if self.cancellation.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let ops = Arc::clone(&self.ops);
        let cancellation = self.cancellation.clone();
        self.handle.block_on(async move {
            tokio::select! {
                result = ops.invoke(call) => result,
                () = cancellation.cancelled() => Err(BridgeError::Cancelled),
            }
        })
    }
}

/// Install `__host_call` and evaluate the prelude in `ctx`
pub fn install_bindings(ctx: &Ctx<'_>, api: HostApi) -> Result<(), ScriptError> {
    let host_call = Func::from(move |name: String, args: String| api.call(&name, &args));
    ctx.globals()
        .set("__host_call", host_call)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;
    ctx.eval::<(), _>(RUNTIME_PRELUDE)
        .map_err(|e| ScriptError::InitError(e.to_string()))?;
    Ok(())
}

/// Script-facing globals built over `__host_call`
pub const RUNTIME_PRELUDE: &str = r#"
((globalThis) => {
    const call = globalThis.__host_call;
    delete globalThis.__host_call;

    class HostError extends Error {
        constructor(kind, message) {
            super(message);
            this.name = "HostError";
            this.kind = kind;
        }
    }

    function op(name, ...args) {
        const reply = JSON.parse(call(name, JSON.stringify(args)));
        if (reply.err) {
            throw new HostError(reply.err.kind, reply.err.message);
        }
        return reply.ok;
    }

    function render(args) {
        return args
            .map((arg) => {
                if (typeof arg === "string") return arg;
                if (arg === undefined) return "undefined";
                if (arg instanceof Error) return String(arg);
                return JSON.stringify(arg);
            })
            .join(" ");
    }

    function toPairs(value) {
        if (value == null) return [];
        if (Array.isArray(value)) {
            return value.map((pair) => ({
                name: String(pair.name ?? pair.key),
                value: String(pair.value),
            }));
        }
        return Object.keys(value).map((name) => ({ name, value: String(value[name]) }));
    }

    function toRequest(input, init) {
        const req = Object.assign({}, typeof input === "string" ? { url: input } : input, init);
        const body = req.body;
        return {
            method: String(req.method || "GET").toUpperCase(),
            url: String(req.url || ""),
            headers: toPairs(req.headers),
            params: toPairs(req.params),
            body: body == null ? "" : typeof body === "string" ? body : JSON.stringify(body),
        };
    }

    const orNull = (value) => (value === undefined ? null : value);

    globalThis.HostError = HostError;

    globalThis.sleep = async (ms) => {
        op("sleep", Number(ms));
    };

    globalThis.fetch = async (input, init) => op("http_fetch", toRequest(input, init));

    globalThis.assert = (expect, actual) => op("assert", orNull(expect), orNull(actual));

    globalThis.assert_nlp = (expect, actual, threshold) =>
        op("assert_nlp", String(expect), String(actual), Number(threshold));

    globalThis.testcase = () => op("get_testcase");

    globalThis.console = {
        log: (...args) => {
            op("log", render(args));
        },
        info: (...args) => {
            op("log", render(args));
        },
        warn: (...args) => {
            op("warn", render(args));
        },
        error: (...args) => {
            op("error", render(args));
        },
    };

    globalThis.nlp = {
        keywords: (text, k) => op("nlp_keywords", String(text), Number(k)),
        tags: (text) => op("nlp_tags", String(text)),
        tag_filter: (text, tags) => op("nlp_tag_filter", String(text), Array.from(tags, String)),
        similarity: (a, b) => op("nlp_similarity", String(a), String(b)),
    };

    const host = {
        get_testcase: () => op("get_testcase"),
        set_env: (key, value) => {
            op("set_env", String(key), String(value));
        },
        get_env: (key) => op("get_env", String(key)),
        add_header: (name, value) => {
            op("add_header", String(name), String(value));
        },
        add_params: (name, value) => {
            op("add_params", String(name), String(value));
        },
        set_shared: (key, value) => {
            op("set_shared", String(key), orNull(value));
        },
        get_shared: (key) => op("get_shared", String(key)),
        wait_shared: async (key) => op("wait_shared", String(key)),
        resp: () => op("response"),
        equal: (a, b) => op("equal", orNull(a), orNull(b)),
        record: (passed, message) => {
            op("append_assert", Boolean(passed), String(message));
        },
        open_test: (name) => {
            op("open_test", String(name));
        },
        close_test: (name) => {
            op("close_test", String(name));
        },
        test_skip: () => {
            op("test_skip");
        },
        test: (name, func) => {
            name = String(name);
            op("open_test", name);
            let result;
            try {
                result = func();
            } catch (e) {
                op("close_test", name);
                throw e;
            }
            if (result && typeof result.then === "function") {
                return Promise.resolve(result).finally(() => op("close_test", name));
            }
            op("close_test", name);
            return result;
        },
    };

    globalThis.host = host;
    globalThis.test = host.test;
    globalThis.test_skip = host.test_skip;
})(globalThis);
"#;

/// TypeScript definition for the host API
pub const TYPESCRIPT_DEFINITIONS: &str = r#"
/**
 * Hostbridge Script API
 *
 * Available to pre-request and test scripts. Host failures are thrown as
 * `HostError` with a stable `kind`.
 */

declare class HostError extends Error {
    kind: "UnknownOperation" | "InvalidArgument" | "NetworkError" | "Timeout" | "Cancelled" | "HostError";
}

interface KeyValue {
    name: string;
    value: string;
}

interface HttpRequest {
    method?: string;
    url: string;
    headers?: KeyValue[] | Record<string, string>;
    params?: KeyValue[] | Record<string, string>;
    body?: string | object;
}

interface HttpResponse {
    status: number;
    headers: KeyValue[];
    text: string;
    /** Present only when the body parses as JSON */
    json?: any;
}

/**
 * Suspend the script.
 * @param ms Duration in milliseconds; longer than the host limit throws `InvalidArgument`
 */
declare function sleep(ms: number): Promise<void>;

/** Perform an HTTP request through the host. */
declare function fetch(request: string | HttpRequest, init?: Partial<HttpRequest>): Promise<HttpResponse>;

/** Record a deep-equality assertion. Returns whether it passed. */
declare function assert(expect: any, actual: any): boolean;

/** Record an assertion that passes when similarity is strictly above `threshold`. */
declare function assert_nlp(expect: string, actual: string, threshold: number): boolean;

/** Test case data supplied by the host. */
declare function testcase(): any;

declare function test<T>(name: string, func: () => T): T;
declare function test_skip(): void;

declare namespace console {
    function log(...args: any[]): void;
    function info(...args: any[]): void;
    function warn(...args: any[]): void;
    function error(...args: any[]): void;
}

declare namespace nlp {
    function keywords(text: string, k: number): string[];
    function tags(text: string): { word: string; tag: string }[];
    function tag_filter(text: string, tags: string[]): string[];
    function similarity(a: string, b: string): number;
}

declare namespace host {
    function get_testcase(): any;
    function set_env(key: string, value: any): void;
    /** `null` when the key is not set */
    function get_env(key: string): string | null;
    function add_header(name: string, value: any): void;
    function add_params(name: string, value: any): void;
    /** Share a value with every other script of the same run. */
    function set_shared(key: string, value: any): void;
    function get_shared(key: string): any;
    /** Wait until another script sets `key`; throws `Timeout` when the wait is bounded out. */
    function wait_shared(key: string): Promise<any>;
    /** Response of the request under test, or `null` before it was sent. */
    function resp(): HttpResponse | null;
    function equal(a: any, b: any): boolean;
    function record(passed: boolean, message: string): void;
    function open_test(name: string): void;
    function close_test(name: string): void;
    /** Run `func` inside a named test block; the block closes on every exit path. */
    function test<T>(name: string, func: () => T): T;
    /** Mark the run skipped; assertions become informational. */
    function test_skip(): void;
}
"#;
