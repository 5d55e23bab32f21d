use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Caller-supplied function the model may invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: JsonSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: BTreeMap<String, SchemaProperty>,
    pub required: Vec<String>,
}

impl Default for JsonSchema {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl JsonSchema {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.schema_type,
            "properties": self.properties,
            "required": self.required,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProperty {
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub r#enum: Vec<String>,
}

/// A model-requested function invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    /// Raw JSON text exactly as received; fragments are only concatenated.
    pub arguments: String,
    /// Opaque provider metadata that must be echoed back unchanged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thought_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    /// Tool use is required; `name` pins a single function.
    Force { name: Option<String> },
}

impl ToolChoice {
    /// Rejects a forced choice that names a function missing from `tools`.
    pub fn validate(&self, tools: &[Tool]) -> Result<(), LlmError> {
        if let Some(name) = self.forced_name() {
            if !tools.iter().any(|t| t.name == name) {
                return Err(LlmError::InvalidToolChoice(format!(
                    "forced tool {name:?} is not declared"
                )));
            }
        }
        Ok(())
    }

    /// The forced function name, if any; blank names count as unset.
    pub fn forced_name(&self) -> Option<&str> {
        match self {
            Self::Force { name: Some(name) } if !name.trim().is_empty() => Some(name.as_str()),
            _ => None,
        }
    }
}

impl FromStr for ToolChoice {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "auto" => return Ok(Self::Auto),
            "none" => return Ok(Self::None),
            "required" | "force" => return Ok(Self::Force { name: None }),
            _ => {}
        }
        match s.strip_prefix("force:") {
            Some(name) if !name.trim().is_empty() => Ok(Self::Force {
                name: Some(name.trim().to_string()),
            }),
            _ => Err(LlmError::InvalidToolChoice(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_tool() -> Tool {
        let mut properties = BTreeMap::new();
        properties.insert(
            "city".to_string(),
            SchemaProperty {
                property_type: "string".into(),
                description: "city name".into(),
                r#enum: Vec::new(),
            },
        );
        Tool {
            name: "lookup_weather".into(),
            description: "Look up the weather".into(),
            parameters: JsonSchema {
                properties,
                required: vec!["city".into()],
                ..JsonSchema::default()
            },
        }
    }

    #[test]
    fn parses_tool_choice_forms() {
        assert_eq!("auto".parse::<ToolChoice>().unwrap(), ToolChoice::Auto);
        assert_eq!("none".parse::<ToolChoice>().unwrap(), ToolChoice::None);
        assert_eq!(
            "required".parse::<ToolChoice>().unwrap(),
            ToolChoice::Force { name: None }
        );
        assert_eq!(
            "force:lookup_weather".parse::<ToolChoice>().unwrap(),
            ToolChoice::Force {
                name: Some("lookup_weather".into())
            }
        );
    }

    #[test]
    fn malformed_tool_choice_is_rejected() {
        assert!(matches!(
            "sometimes".parse::<ToolChoice>(),
            Err(LlmError::InvalidToolChoice(_))
        ));
        assert!("force:".parse::<ToolChoice>().is_err());
    }

    #[test]
    fn forced_tool_must_be_declared() {
        let tools = vec![weather_tool()];
        let ok = ToolChoice::Force {
            name: Some("lookup_weather".into()),
        };
        let missing = ToolChoice::Force {
            name: Some("lookup_time".into()),
        };
        assert!(ok.validate(&tools).is_ok());
        assert!(missing.validate(&tools).is_err());
        assert!(ToolChoice::Auto.validate(&[]).is_ok());
    }

    #[test]
    fn schema_serializes_as_json_schema_object() {
        let value = weather_tool().parameters.to_value();
        assert_eq!(value["type"], "object");
        assert_eq!(value["properties"]["city"]["type"], "string");
        assert_eq!(value["required"][0], "city");
        assert!(value["properties"]["city"].get("enum").is_none());
    }
}
