// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod context;
pub mod callstack;
pub mod ringbuf;
pub mod symbols;
pub mod os;

pub use context::{
    ContextError,
    ContextField,
    ContextSet,
    ContextValue,
    ProbeContext,
    TaskSnapshot,
};

pub use callstack::{
    add_callstack_to_ctx,
    CallstackField,
    CallstackMode,
    StackWalker,
    MAX_ENTRIES,
    STACK_DELIMITER,
};
pub use ringbuf::{align_padding, CpuBuffer, EventWriter, MAX_NESTING};
pub use symbols::{SymbolResolver, SymbolTable};
