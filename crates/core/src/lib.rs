//! Shards core engine: a dataflow runtime of composable typed operators
//!
//! Key design pieces:
//! - `Var`: the polymorphic value flowing between shards
//! - `Shard`: the operator contract (warmup/activate/cleanup)
//! - `Wire`: a fiber-hosted pipeline of shards
//! - `Mesh`: the cooperative scheduler hosting many wires on one thread
//!
//! Composition (`compose_wire`) statically checks a wire before it ever
//! runs; the mesh then drives it through a stackful fiber until it
//! ends, fails or is stopped.

pub mod blocking;
pub mod compose;
pub mod context;
pub mod error;
pub mod events;
pub mod fiber;
pub mod hash;
pub mod interface;
pub mod mesh;
pub mod registry;
pub mod serialize;
pub mod shard;
pub mod signals;
pub mod tidepool;
pub mod types;
pub mod value;
pub mod wire;

// Re-export key types and functions
pub use value::{
    almost_equal, clone_var, destroy_var, seq_push, seq_resize, Audio, Image, ObjectData,
    ObjectHandle, PackedArray, ShColor, ShEnum, ShObject, ShSet, ShTable, ShType, Var, VarFlags,
    Variable, VariableRef, WireTrait,
};

pub use types::{derive_type, match_types, ExposedTypeInfo, TypeInfo, TypeMatcher};

pub use error::{ActivationError, ComposeError, SerializeError, ShardError};

pub use hash::{hash_type, hash_var, hash_var_to_int2, hash_wire};

pub use shard::{shard_name_hash, InlineShardId, ParameterInfo, Shard, ShardInstance};

pub use compose::{
    compose_shards, compose_wire, default_validation_callback, validate_set_param, ComposeResult,
    InstanceData, ValidationCallback,
};

pub use context::{
    get_or_create_any_storage, reference_variable, release_variable, suspend, Context, WireState,
};

pub use fiber::{yield_current, Fiber, DEFAULT_STACK_SIZE};

pub use wire::{
    activate_shards, cleanup_wire, emit_detached, emit_event, has_ended, is_canceled, is_running,
    prepare, run_sub_wire, run_wire, start, stop, stop_ex, tick_wire, warmup_wire,
    ExternalVariable, RunState, RunWireOutput, RunWireOutputState, Wire, WireEvent,
};

pub use mesh::{Flow, Mesh, MeshError};

pub use blocking::{await_blocking, call_on_mesh_thread};

pub use tidepool::{tide_pool, TidePool, LOW_WATER, MAX_WORKERS, NUM_WORKERS};

pub use events::{get_event_dispatcher, EventDispatcher};

pub use serialize::{from_bytes, to_bytes, BufferReader, BufferWriter, Serialization};

pub use registry::{
    create_shard, find_enum_type, find_object_type, get_global_wire, get_setting, has_shard,
    register_enum_type, register_object_type, register_shard, remove_global_wire, set_global_wire,
    set_setting, EnumTypeInfo, ObjectTypeInfo, ShardConstructor,
};

pub use signals::{install_signal_handlers, interrupt_count, post_interrupt, reset_interrupts};

pub use interface::{shards_interface, ShardsInterface, ABI_VERSION};
