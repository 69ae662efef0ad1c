use std::path::Path;

use serde::Deserialize;
use wren_core::{Error, Result};

/// One operator record as written in a declaration file.
///
/// Forward files use `op`, gradient files use `backward_op` and may carry a
/// `forward` line describing the forward signature; both land in `op`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpDecl {
    #[serde(alias = "backward_op")]
    pub op: String,
    pub args: String,
    pub output: String,
    pub infer_meta: InferMetaDecl,
    pub kernel: KernelDecl,
    #[serde(default)]
    pub optional: Option<String>,
    #[serde(default)]
    pub traits: Option<String>,
    #[serde(default)]
    pub backward: Option<String>,
    #[serde(default)]
    pub forward: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InferMetaDecl {
    pub func: String,
    #[serde(default)]
    pub param: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelDecl {
    pub func: String,
    #[serde(default)]
    pub data_type: Option<String>,
}

/// Parse a YAML list of operator records.
pub fn parse_decls_str(yaml: &str) -> Result<Vec<OpDecl>> {
    serde_yaml::from_str(yaml).map_err(|e| Error::schema("<declarations>", e.to_string()))
}

/// Read and parse a declaration file.
pub fn parse_decls_file(path: &Path) -> Result<Vec<OpDecl>> {
    let content = std::fs::read_to_string(path)?;
    parse_decls_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX_ADD: &str = r#"
- op : index_add
  args : (Tensor x, Tensor index, Tensor add_value, int axis = 0)
  output : Tensor(out)
  infer_meta :
    func : IndexAddInferMeta
    param : [x, index, add_value, axis]
  kernel :
    func : index_add
    data_type : x
  backward : index_add_grad
"#;

    #[test]
    fn test_parse_forward_record() {
        let decls = parse_decls_str(INDEX_ADD).unwrap();
        assert_eq!(decls.len(), 1);
        let d = &decls[0];
        assert_eq!(d.op, "index_add");
        assert_eq!(d.infer_meta.func, "IndexAddInferMeta");
        assert_eq!(d.infer_meta.param.as_ref().map(Vec::len), Some(4));
        assert_eq!(d.kernel.data_type.as_deref(), Some("x"));
        assert_eq!(d.backward.as_deref(), Some("index_add_grad"));
    }

    #[test]
    fn test_parse_backward_record() {
        let yaml = r#"
- backward_op : index_add_grad
  forward : index_add (Tensor x, Tensor index, Tensor add_value, int axis) -> Tensor(out)
  args : (Tensor index, Tensor add_value, Tensor out_grad, int axis)
  output : Tensor(x_grad), Tensor(add_value_grad)
  infer_meta :
    func : IndexAddGradInferMeta
  kernel :
    func : index_add_grad
    data_type : out_grad
  optional : x_grad, add_value_grad
"#;
        let decls = parse_decls_str(yaml).unwrap();
        assert_eq!(decls[0].op, "index_add_grad");
        assert!(decls[0].forward.is_some());
        assert!(decls[0].infer_meta.param.is_none());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let yaml = "- op : a\n  args : ()\n  output : Tensor(out)\n  infer_meta : {func: UnchangedInferMeta}\n  kernel : {func: a}\n  colour : red\n";
        assert!(matches!(
            parse_decls_str(yaml),
            Err(Error::InvalidSchema { .. })
        ));
    }
}
