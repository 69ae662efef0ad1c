//! # wren-meta
//!
//! What an operator is, independent of any kernel:
//!
//! - [`attr`]: typed attribute values and default literals
//! - [`decl`]: YAML operator declarations
//! - [`OperatorSchema`]: a validated declaration
//! - [`OpRegistry`]: name-keyed schemas
//! - [`padding`]: convolution padding and output-size rules
//! - [`infer`]: shape/type inference functions

pub mod attr;
pub mod decl;
pub mod infer;
pub mod padding;
pub mod registry;
pub mod schema;

pub use attr::{AttrMap, AttrType, AttrValue};
pub use decl::{parse_decls_file, parse_decls_str, OpDecl};
pub use infer::{InferContext, InferMetaFn, InferMetaRegistry, InferParam};
pub use padding::{ConvAttrs, ConvGeometry, PaddingAlgorithm};
pub use registry::OpRegistry;
pub use schema::{grad_op_name, ArgDef, ArgKind, OperatorSchema, OutputDef};
