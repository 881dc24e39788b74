//! The SSA intermediate representation: type system, value graph, builder,
//! textual dump/reader, and the structural verifier.

pub mod builder;
pub mod dump;
pub mod module;
pub mod parse;
pub mod types;
pub mod value;
pub mod verify;

pub use builder::{BinaryOp, IrBuilder};
pub use module::Module;
pub use types::{Ty, TypeKind, TypeTable};
pub use value::{
    CmpPred, ConstKind, FnAttrs, GlobalInit, Opcode, Use, Value, ValueData, ValueKind,
};
