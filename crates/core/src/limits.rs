//! Engine limits and sentinels.
//!
//! These bound the register stack, native recursion, and a few dispatch-loop
//! internals. The stack ceiling and native depth are defaults; the runtime
//! lets embedders lower them per instance.

/// Default ceiling on a task's register stack, in value slots.
///
/// Growth doubles up to this size. Exceeding it raises a recoverable
/// "stack overflow" error rather than aborting.
pub const MAX_STACK: usize = 1_000_000;

/// Extra slots granted past the ceiling so the overflow-handling path
/// (error construction, message handler) has room to run.
pub const ERROR_HEADROOM: usize = 200;

/// Slack kept above every frame's declared top. Lets the engine push a
/// metamethod callable plus its operands without a grow check.
pub const EXTRA_STACK: usize = 5;

/// Minimum free slots guaranteed to a native function on entry.
pub const MIN_NATIVE_SLOTS: usize = 20;

/// Initial register-stack size for a fresh task.
pub const BASE_STACK_SIZE: usize = 2 * MIN_NATIVE_SLOTS;

/// Default bound on nested native activations (native calls, overload
/// fallbacks, nested resumes). Exceeding it is a recoverable error; going
/// well past it while already handling that error is the double-fault path.
pub const MAX_NATIVE_DEPTH: u32 = 200;

/// Maximum upvalues a prototype may declare. Checked at chunk load.
pub const MAX_UPVALUES: usize = 255;

/// Expected-result sentinel: "as many results as the callee produces".
pub const MULTRET: i32 = -1;

/// Elements moved per list-initialization batch (the `SetList` block size).
pub const FIELDS_PER_FLUSH: u32 = 50;

/// Bound on chained index overloads before the engine reports a loop.
pub const MAX_INDEX_CHAIN: u32 = 100;
