use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The caller-supplied data a flag is evaluated against.
///
/// A context is an untyped, arbitrarily nested JSON object. Values are addressed by a
/// [crate::Property]'s path: each path element is a key into the object found at the previous
/// level, so the path `["user", "email"]` addresses `"x@acme.com"` in
///
/// ```json
/// { "user": { "email": "x@acme.com" } }
/// ```
///
/// # Example
/// ```
/// # use flagspec::EvaluationContext;
/// # use serde_json::json;
/// let context = EvaluationContext::builder()
///     .set_value("email", "x@acme.com")
///     .set_value("plan", json!({"tier": "gold"}))
///     .build();
///
/// assert_eq!(context.value_at(&["email"]), Some(&json!("x@acme.com")));
/// assert_eq!(context.value_at(&["plan", "tier"]), Some(&json!("gold")));
/// assert_eq!(context.value_at(&["plan", "missing"]), None);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct EvaluationContext {
    attributes: Map<String, Value>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Looks up the value at `path`. An empty path, a path that walks through a non-object, and
    /// explicit `null` values all resolve to `None`.
    pub fn value_at<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.attributes.get(first.as_ref())?;
        for key in rest {
            current = current.as_object()?.get(key.as_ref())?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl From<Map<String, Value>> for EvaluationContext {
    fn from(attributes: Map<String, Value>) -> Self {
        Self { attributes }
    }
}

impl TryFrom<Value> for EvaluationContext {
    type Error = Value;

    /// Only JSON objects are valid contexts; anything else is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(attributes) => Ok(Self { attributes }),
            other => Err(other),
        }
    }
}

/// Builds an [EvaluationContext] one top-level attribute at a time.
#[derive(Clone, Debug, Default)]
pub struct ContextBuilder {
    attributes: Map<String, Value>,
}

impl ContextBuilder {
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> &mut Self {
        self.attributes.remove(key);
        self
    }

    pub fn build(&self) -> EvaluationContext {
        EvaluationContext {
            attributes: self.attributes.clone(),
        }
    }
}
