use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use wren_core::{Error, Result};

use crate::decl::{parse_decls_file, parse_decls_str};
use crate::schema::{grad_op_name, OperatorSchema};

/// Name-keyed store of validated operator schemas.
#[derive(Debug, Clone, Default)]
pub struct OpRegistry {
    ops: HashMap<String, Arc<OperatorSchema>>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from one YAML declaration document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut reg = Self::new();
        reg.load_yaml_str(yaml)?;
        Ok(reg)
    }

    pub fn register(&mut self, schema: OperatorSchema) -> Result<()> {
        if self.ops.contains_key(&schema.name) {
            return Err(Error::DuplicateOperator(schema.name));
        }
        tracing::debug!(op = %schema.name, args = schema.args.len(), outputs = schema.outputs.len(), "registered operator");
        self.ops.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    /// Register every record of a YAML document. Returns the number added.
    pub fn load_yaml_str(&mut self, yaml: &str) -> Result<usize> {
        let decls = parse_decls_str(yaml)?;
        let n = decls.len();
        for decl in &decls {
            self.register(OperatorSchema::from_decl(decl)?)?;
        }
        Ok(n)
    }

    pub fn load_yaml_file(&mut self, path: &Path) -> Result<usize> {
        let decls = parse_decls_file(path)?;
        let n = decls.len();
        for decl in &decls {
            self.register(OperatorSchema::from_decl(decl)?)?;
        }
        tracing::debug!(path = %path.display(), ops = n, "loaded declarations");
        Ok(n)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<OperatorSchema>> {
        self.ops
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownOperator(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Registered operator names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Gradient schema of `op`, if one is registered.
    pub fn grad_of(&self, op: &str) -> Option<Arc<OperatorSchema>> {
        self.ops.get(&grad_op_name(op)).cloned()
    }

    /// Every declared `backward` must name a registered operator.
    pub fn check_backward_links(&self) -> Result<()> {
        for name in self.names() {
            let schema = &self.ops[name];
            if let Some(bw) = &schema.backward {
                if !self.ops.contains_key(bw) {
                    return Err(Error::schema(
                        name,
                        format!("backward operator '{bw}' is not registered"),
                    ));
                }
            }
        }
        Ok(())
    }
}
