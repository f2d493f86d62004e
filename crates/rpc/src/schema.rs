//! Method schema: the per-`(class, method)` argument shape used to
//! name-align positional parameters and validate inputs (§4.F).

use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct MethodArg {
    pub name: String,
    pub optional: bool,
    pub default: Option<Value>,
}

impl MethodArg {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            optional: true,
            default: Some(default),
        }
    }
}

/// Describes one callable `Class.method`: its full ordered argument list
/// and which leading subset is consumed by facade construction rather than
/// by the method call itself.
#[derive(Debug, Clone)]
pub struct MethodSchema {
    pub class: String,
    pub method: String,
    pub ctor_args: Vec<String>,
    pub args: Vec<MethodArg>,
}

impl MethodSchema {
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
            ctor_args: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn ctor_args(mut self, names: &[&str]) -> Self {
        self.ctor_args = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn arg(mut self, arg: MethodArg) -> Self {
        self.args.push(arg);
        self
    }

    /// `allArgs - ctorArgs`, preserving declaration order (§4.F).
    pub fn method_args(&self) -> impl Iterator<Item = &MethodArg> {
        self.args
            .iter()
            .filter(move |a| !self.ctor_args.contains(&a.name))
    }

    /// Reorders positional parameters into a keyed map, or validates a
    /// keyed map already has the right shape. Returns the name of the
    /// first missing required argument on failure.
    pub fn name_align(&self, params: Option<&Value>) -> Result<HashMap<String, Value>, String> {
        let mut keyed = HashMap::new();

        match params {
            None | Some(Value::Null) => {}
            Some(Value::Array(positional)) => {
                for (arg, value) in self.args.iter().zip(positional.iter()) {
                    keyed.insert(arg.name.clone(), value.clone());
                }
            }
            Some(Value::Object(map)) => {
                for (k, v) in map {
                    keyed.insert(k.clone(), v.clone());
                }
            }
            Some(_) => return Err("params must be an array or object".to_string()),
        }

        for arg in &self.args {
            if !keyed.contains_key(&arg.name) {
                if arg.optional {
                    if let Some(default) = &arg.default {
                        keyed.insert(arg.name.clone(), default.clone());
                    }
                } else {
                    return Err(arg.name.clone());
                }
            }
        }

        Ok(keyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_params_are_named() {
        let schema = MethodSchema::new("Host", "getVMList")
            .ctor_args(&[])
            .arg(MethodArg::required("full"));
        let keyed = schema.name_align(Some(&serde_json::json!([true]))).unwrap();
        assert_eq!(keyed.get("full"), Some(&Value::Bool(true)));
    }

    #[test]
    fn missing_required_arg_names_the_field() {
        let schema = MethodSchema::new("VM", "create").arg(MethodArg::required("vmId"));
        let err = schema.name_align(None).unwrap_err();
        assert_eq!(err, "vmId");
    }

    #[test]
    fn optional_arg_gets_default() {
        let schema = MethodSchema::new("VM", "destroy")
            .arg(MethodArg::optional("force", Value::Bool(false)));
        let keyed = schema.name_align(None).unwrap();
        assert_eq!(keyed.get("force"), Some(&Value::Bool(false)));
    }
}
