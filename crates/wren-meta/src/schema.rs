use std::collections::HashSet;

use wren_core::{Error, Result};

use crate::attr::{split_top_level, AttrMap, AttrType, AttrValue};
use crate::decl::OpDecl;

// OperatorSchema: Validated form of one operator declaration
//
// A declaration names everything the framework needs to run an operator
// without knowing it in advance:
//
//   args          ordered tensor inputs and typed attributes with defaults
//   outputs       ordered output names
//   infer_meta    which inference function computes output descriptors,
//                 and which args it reads (in order)
//   kernel        kernel name, and which tensor arg decides the dtype key
//   optional      tensor inputs or outputs that may be absent
//   backward      name of the gradient operator (`<op>_grad`)
//
// `OperatorSchema::from_decl` checks every cross reference, so a schema that
// exists is internally consistent.

/// Name of the gradient operator of `op`.
pub fn grad_op_name(op: &str) -> String {
    format!("{op}_grad")
}

/// Kind of a declared argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Tensor,
    Attr(AttrType),
}

/// One declared argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgDef {
    pub name: String,
    pub kind: ArgKind,
    pub default: Option<AttrValue>,
    pub optional: bool,
}

impl ArgDef {
    pub fn is_tensor(&self) -> bool {
        self.kind == ArgKind::Tensor
    }
}

/// One declared output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDef {
    pub name: String,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferMetaSpec {
    pub func: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub func: String,
    /// Tensor arg whose dtype selects the kernel.
    pub data_type: String,
}

/// A validated operator declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorSchema {
    pub name: String,
    pub args: Vec<ArgDef>,
    pub outputs: Vec<OutputDef>,
    pub infer_meta: InferMetaSpec,
    pub kernel: KernelSpec,
    pub traits: Vec<String>,
    pub backward: Option<String>,
}

impl OperatorSchema {
    pub fn from_decl(decl: &OpDecl) -> Result<Self> {
        let op = decl.op.trim();
        if op.is_empty() {
            return Err(Error::schema("<unnamed>", "empty operator name"));
        }
        let mut args = parse_args(op, &decl.args)?;
        let mut outputs = parse_outputs(op, &decl.output)?;

        for name in comma_list(decl.optional.as_deref()) {
            if let Some(arg) = args.iter_mut().find(|a| a.name == name) {
                if !arg.is_tensor() {
                    return Err(Error::schema(op, format!("optional '{name}' is not a tensor")));
                }
                arg.optional = true;
            } else if let Some(out) = outputs.iter_mut().find(|o| o.name == name) {
                out.optional = true;
            } else {
                return Err(Error::schema(op, format!("optional '{name}' is not declared")));
            }
        }

        let params = match &decl.infer_meta.param {
            Some(p) => p.clone(),
            None => args.iter().map(|a| a.name.clone()).collect(),
        };
        let data_type = match &decl.kernel.data_type {
            Some(d) => d.trim().to_string(),
            None => args
                .iter()
                .find(|a| a.is_tensor())
                .map(|a| a.name.clone())
                .ok_or_else(|| Error::schema(op, "kernel has no tensor argument to key the dtype on"))?,
        };

        let schema = OperatorSchema {
            name: op.to_string(),
            args,
            outputs,
            infer_meta: InferMetaSpec {
                func: decl.infer_meta.func.trim().to_string(),
                params,
            },
            kernel: KernelSpec {
                func: decl.kernel.func.trim().to_string(),
                data_type,
            },
            traits: comma_list(decl.traits.as_deref()),
            backward: decl.backward.as_ref().map(|b| b.trim().to_string()),
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Check internal consistency. Called by `from_decl`; exposed for
    /// schemas built by hand.
    pub fn validate(&self) -> Result<()> {
        let op = self.name.as_str();
        let mut seen = HashSet::new();
        for name in self.args.iter().map(|a| &a.name).chain(self.outputs.iter().map(|o| &o.name)) {
            if !seen.insert(name.as_str()) {
                return Err(Error::schema(op, format!("duplicate name '{name}'")));
            }
        }
        if self.outputs.is_empty() {
            return Err(Error::schema(op, "no outputs declared"));
        }
        for arg in &self.args {
            if arg.is_tensor() && arg.default.is_some() {
                return Err(Error::schema(op, format!("tensor '{}' cannot have a default", arg.name)));
            }
            if arg.optional && !arg.is_tensor() {
                return Err(Error::schema(op, format!("attribute '{}' cannot be optional", arg.name)));
            }
        }
        for p in &self.infer_meta.params {
            if self.arg(p).is_none() {
                return Err(Error::schema(op, format!("infer_meta param '{p}' is not an argument")));
            }
        }
        match self.arg(&self.kernel.data_type) {
            Some(a) if a.is_tensor() => {}
            Some(_) => {
                return Err(Error::schema(
                    op,
                    format!("kernel data_type '{}' is not a tensor", self.kernel.data_type),
                ))
            }
            None => {
                return Err(Error::schema(
                    op,
                    format!("kernel data_type '{}' is not an argument", self.kernel.data_type),
                ))
            }
        }
        if let Some(bw) = &self.backward {
            if *bw != grad_op_name(op) {
                return Err(Error::schema(
                    op,
                    format!("backward must be named '{}', got '{bw}'", grad_op_name(op)),
                ));
            }
        }
        Ok(())
    }

    pub fn arg(&self, name: &str) -> Option<&ArgDef> {
        self.args.iter().find(|a| a.name == name)
    }

    pub fn tensor_args(&self) -> impl Iterator<Item = &ArgDef> {
        self.args.iter().filter(|a| a.is_tensor())
    }

    pub fn attr_args(&self) -> impl Iterator<Item = &ArgDef> {
        self.args.iter().filter(|a| !a.is_tensor())
    }

    /// Position of `name` among the tensor inputs.
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.tensor_args().position(|a| a.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o.name == name)
    }

    pub fn is_grad(&self) -> bool {
        self.name.ends_with("_grad")
    }

    /// Complete the attributes of a call: fill declared defaults, reject
    /// unknown names, missing required attributes and values of the wrong
    /// type.
    pub fn resolve_attrs(&self, provided: &AttrMap) -> Result<AttrMap> {
        for (name, _) in provided.iter() {
            match self.arg(name) {
                Some(a) if !a.is_tensor() => {}
                Some(_) => {
                    return Err(Error::invalid(format!(
                        "'{name}' of '{}' is a tensor, not an attribute",
                        self.name
                    )))
                }
                None => {
                    return Err(Error::invalid(format!(
                        "'{}' has no attribute '{name}'",
                        self.name
                    )))
                }
            }
        }
        let mut resolved = AttrMap::new();
        for arg in self.attr_args() {
            let ArgKind::Attr(ty) = arg.kind else { continue };
            let value = match (provided.get(&arg.name), &arg.default) {
                (Some(v), _) => v.clone().coerce(ty).ok_or_else(|| {
                    Error::invalid(format!(
                        "attribute '{}' of '{}' expects {ty}, got {}",
                        arg.name,
                        self.name,
                        v.attr_type()
                    ))
                })?,
                (None, Some(d)) => d.clone(),
                (None, None) => {
                    return Err(Error::invalid(format!(
                        "missing required attribute '{}' of '{}'",
                        arg.name, self.name
                    )))
                }
            };
            resolved.insert(arg.name.clone(), value);
        }
        Ok(resolved)
    }
}

fn comma_list(s: Option<&str>) -> Vec<String> {
    s.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Parse `(Type name [= default], ...)`.
fn parse_args(op: &str, sig: &str) -> Result<Vec<ArgDef>> {
    let sig = sig.trim();
    let inner = sig
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| Error::schema(op, format!("args must be parenthesised, got '{sig}'")))?;
    let mut args = Vec::new();
    for piece in split_top_level(inner) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (decl, default) = match piece.split_once('=') {
            Some((d, v)) => (d.trim(), Some(v.trim())),
            None => (piece, None),
        };
        let (ty, name) = decl
            .rsplit_once(char::is_whitespace)
            .map(|(t, n)| (t.trim(), n.trim()))
            .ok_or_else(|| Error::schema(op, format!("argument '{decl}' needs a type and a name")))?;
        let kind = if ty == "Tensor" {
            ArgKind::Tensor
        } else {
            ArgKind::Attr(
                AttrType::parse(ty)
                    .ok_or_else(|| Error::schema(op, format!("unsupported type '{ty}' for '{name}'")))?,
            )
        };
        let default = match (kind, default) {
            (ArgKind::Tensor, Some(_)) => {
                return Err(Error::schema(op, format!("tensor '{name}' cannot have a default")))
            }
            (ArgKind::Attr(ty), Some(lit)) => Some(
                AttrValue::parse_literal(ty, lit)
                    .map_err(|e| Error::schema(op, format!("default of '{name}': {e}")))?,
            ),
            (_, None) => None,
        };
        args.push(ArgDef {
            name: name.to_string(),
            kind,
            default,
            optional: false,
        });
    }
    Ok(args)
}

/// Parse `Tensor(a), Tensor(b)`; a bare `Tensor` names the output `out`.
fn parse_outputs(op: &str, s: &str) -> Result<Vec<OutputDef>> {
    split_top_level(s)
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let name = if p == "Tensor" {
                "out"
            } else {
                p.strip_prefix("Tensor(")
                    .and_then(|r| r.strip_suffix(')'))
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| Error::schema(op, format!("output must be 'Tensor(name)', got '{p}'")))?
            };
            Ok(OutputDef {
                name: name.to_string(),
                optional: false,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::parse_decls_str;

    fn schema(yaml: &str) -> Result<OperatorSchema> {
        let decls = parse_decls_str(yaml)?;
        OperatorSchema::from_decl(&decls[0])
    }

    const CONV_GRAD: &str = r#"
- backward_op : conv2d_grad
  args : (Tensor input, Tensor filter, Tensor out_grad, int[] strides, int[] paddings, str padding_algorithm = "EXPLICIT", int[] dilations = {1, 1}, int groups = 1, str data_format = "NCHW")
  output : Tensor(input_grad), Tensor(filter_grad)
  infer_meta :
    func : GeneralBinaryGradInferMeta
    param : [input, filter]
  kernel :
    func : conv2d_grad
    data_type : out_grad
  optional : input_grad, filter_grad
"#;

    #[test]
    fn test_parses_full_signature() {
        let s = schema(CONV_GRAD).unwrap();
        assert_eq!(s.name, "conv2d_grad");
        assert_eq!(s.tensor_args().count(), 3);
        assert_eq!(s.attr_args().count(), 6);
        assert_eq!(
            s.arg("dilations").unwrap().default,
            Some(AttrValue::IntArray(vec![1, 1]))
        );
        assert_eq!(
            s.arg("padding_algorithm").unwrap().default,
            Some(AttrValue::Str("EXPLICIT".into()))
        );
        assert!(s.outputs.iter().all(|o| o.optional));
        assert_eq!(s.input_index("out_grad"), Some(2));
        assert!(s.is_grad());
    }

    #[test]
    fn test_resolve_fills_defaults_and_checks_types() {
        let s = schema(CONV_GRAD).unwrap();
        let provided = AttrMap::new().with("strides", [1i64, 1]).with("paddings", [0i64, 0]);
        let attrs = s.resolve_attrs(&provided).unwrap();
        assert_eq!(attrs.int("groups").unwrap(), 1);
        assert_eq!(attrs.str("data_format").unwrap(), "NCHW");

        let missing = AttrMap::new().with("strides", [1i64, 1]);
        assert!(matches!(s.resolve_attrs(&missing), Err(Error::InvalidArgument(_))));

        let unknown = provided.clone().with("stride", 2i64);
        assert!(matches!(s.resolve_attrs(&unknown), Err(Error::InvalidArgument(_))));

        let wrong = provided.clone().with("groups", "two");
        assert!(matches!(s.resolve_attrs(&wrong), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_int_accepted_for_float() {
        let s = schema(
            "- op : scale\n  args : (Tensor x, float scale = 1.0f)\n  output : Tensor(out)\n  infer_meta : {func: UnchangedInferMeta, param: [x]}\n  kernel : {func: scale}\n",
        )
        .unwrap();
        let attrs = s.resolve_attrs(&AttrMap::new().with("scale", 3i64)).unwrap();
        assert_eq!(attrs.float("scale").unwrap(), 3.0);
        assert_eq!(s.kernel.data_type, "x");
    }

    #[test]
    fn test_rejects_inconsistent_declarations() {
        let base = |args: &str, extra: &str| {
            format!(
                "- op : f\n  args : {args}\n  output : Tensor(out)\n  infer_meta : {{func: UnchangedInferMeta, param: [x]}}\n  kernel : {{func: f, data_type: x}}\n{extra}"
            )
        };
        // duplicate argument
        assert!(schema(&base("(Tensor x, int x)", "")).is_err());
        // tensor with default
        assert!(schema(&base("(Tensor x = 1)", "")).is_err());
        // default that does not parse as the declared type
        assert!(schema(&base("(Tensor x, int axis = 1.5)", "")).is_err());
        // optional attribute
        assert!(schema(&base("(Tensor x, int axis)", "  optional : axis\n")).is_err());
        // infer param that is not an argument
        assert!(schema(&base("(Tensor y)", "")).is_err());
        // backward with the wrong name
        assert!(schema(&base("(Tensor x)", "  backward : f_backward\n")).is_err());
        assert!(schema(&base("(Tensor x)", "  backward : f_grad\n")).is_ok());
        // unknown type
        assert!(matches!(
            schema(&base("(Tensor x, complex c)", "")),
            Err(Error::InvalidSchema { .. })
        ));
    }

    #[test]
    fn test_grad_name() {
        assert_eq!(grad_op_name("sparse_attention"), "sparse_attention_grad");
    }
}
