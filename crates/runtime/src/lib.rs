//! Built-in core shards for the Shards engine
//!
//! The engine's semantics reference a small set of operators by name:
//! constants, logging, flow control, variable access, math, pauses and
//! inline sub-wires. This crate implements them against the `Shard`
//! contract and registers them in the process registry.
//!
//! Call `register_core_shards()` once at startup (idempotent) before
//! deserializing snapshots or building wires by name.

pub mod core;
pub mod math;
pub mod subwires;
pub mod time;
pub mod vars;

use std::sync::Once;

use shards_core::registry::register_shard;
use shards_core::shard::ShardInstance;

pub use crate::core::{
    expect_bool, expect_float, expect_int, expect_seq, expect_string, And, Const, ExpectType,
    Fail, Input, Log, Or, Pass, Restart, Return, Stop,
};
pub use crate::math::{add, multiply, subtract, MathBinary};
pub use crate::subwires::Do;
pub use crate::time::Pause;
pub use crate::vars::{Get, Push, Ref, Set, Update};

static REGISTER: Once = Once::new();

/// Register every core shard under its full name. Idempotent.
pub fn register_core_shards() {
    REGISTER.call_once(|| {
        register_shard("Const", || ShardInstance::new(Const::default()));
        register_shard("Pass", || ShardInstance::new(Pass));
        register_shard("Log", || ShardInstance::new(Log::default()));
        register_shard("Input", || ShardInstance::new(Input));
        register_shard("And", || ShardInstance::new(And));
        register_shard("Or", || ShardInstance::new(Or));
        register_shard("Restart", || ShardInstance::new(Restart));
        register_shard("Return", || ShardInstance::new(Return));
        register_shard("Fail", || ShardInstance::new(Fail::default()));
        register_shard("Stop", || ShardInstance::new(Stop::default()));
        register_shard("Expect", || ShardInstance::new(ExpectType::open()));
        register_shard("ExpectInt", || ShardInstance::new(expect_int()));
        register_shard("ExpectFloat", || ShardInstance::new(expect_float()));
        register_shard("ExpectBool", || ShardInstance::new(expect_bool()));
        register_shard("ExpectString", || ShardInstance::new(expect_string()));
        register_shard("ExpectSeq", || ShardInstance::new(expect_seq()));
        register_shard("Math.Add", || ShardInstance::new(add()));
        register_shard("Math.Subtract", || ShardInstance::new(subtract()));
        register_shard("Math.Multiply", || ShardInstance::new(multiply()));
        register_shard("Set", || ShardInstance::new(Set::default()));
        register_shard("Ref", || ShardInstance::new(Ref::default()));
        register_shard("Update", || ShardInstance::new(Update::default()));
        register_shard("Get", || ShardInstance::new(Get::default()));
        register_shard("Push", || ShardInstance::new(Push::default()));
        register_shard("Pause", || ShardInstance::new(Pause::default()));
        register_shard("Do", || ShardInstance::new(Do::default()));
    });
}
