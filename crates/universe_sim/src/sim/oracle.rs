//! Behavior oracle seam and the OpenAI-compatible chat client behind it.
//!
//! The kernel only sees the [`ActionOracle`] trait; the default
//! implementation asks a chat-completions endpoint to pick the next action
//! for an actor and parses the JSON object out of the reply.

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const ENV_ORACLE_MODEL: &str = "UNIVERSE_SIM_ORACLE_MODEL";
pub const ENV_ORACLE_BASE_URL: &str = "UNIVERSE_SIM_ORACLE_BASE_URL";
pub const ENV_ORACLE_API_KEY: &str = "UNIVERSE_SIM_ORACLE_API_KEY";
pub const ENV_ORACLE_TIMEOUT_MS: &str = "UNIVERSE_SIM_ORACLE_TIMEOUT_MS";

pub const DEFAULT_CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 45_000;
pub const DEFAULT_ORACLE_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

impl OracleConfig {
    pub fn from_default_sources() -> Result<Self, OracleConfigError> {
        let config_path = Path::new(DEFAULT_CONFIG_FILE_NAME);
        if config_path.exists() {
            return Self::from_config_file(config_path);
        }
        Self::from_env()
    }

    pub fn from_config_file(path: &Path) -> Result<Self, OracleConfigError> {
        let content = fs::read_to_string(path).map_err(|err| OracleConfigError::ReadConfigFile {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let value: toml::Value =
            toml::from_str(&content).map_err(|err| OracleConfigError::ParseConfigFile {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        let table = value
            .as_table()
            .ok_or_else(|| OracleConfigError::ParseConfigFile {
                path: path.display().to_string(),
                message: "root is not a TOML table".to_string(),
            })?;

        Self::from_env_with(|key| {
            table
                .get(key)
                .and_then(toml_value_to_string)
                .or_else(|| std::env::var(key).ok())
        })
    }

    pub fn from_env() -> Result<Self, OracleConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    fn from_env_with<F>(mut getter: F) -> Result<Self, OracleConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let model = required_env(&mut getter, ENV_ORACLE_MODEL)?;
        let base_url = required_env(&mut getter, ENV_ORACLE_BASE_URL)?;
        let api_key = required_env(&mut getter, ENV_ORACLE_API_KEY)?;
        let timeout_ms = match getter(ENV_ORACLE_TIMEOUT_MS) {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| OracleConfigError::InvalidTimeout { value })?,
            None => DEFAULT_ORACLE_TIMEOUT_MS,
        };

        Ok(Self {
            model,
            base_url,
            api_key,
            timeout_ms,
        })
    }
}

fn toml_value_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(value) => Some(value.clone()),
        toml::Value::Integer(value) => Some(value.to_string()),
        toml::Value::Float(value) => Some(value.to_string()),
        toml::Value::Boolean(value) => Some(value.to_string()),
        _ => None,
    }
}

fn required_env<F>(getter: &mut F, key: &'static str) -> Result<String, OracleConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = getter(key).ok_or(OracleConfigError::MissingEnv { key })?;
    if value.trim().is_empty() {
        return Err(OracleConfigError::EmptyEnv { key });
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleConfigError {
    MissingEnv { key: &'static str },
    EmptyEnv { key: &'static str },
    InvalidTimeout { value: String },
    ReadConfigFile { path: String, message: String },
    ParseConfigFile { path: String, message: String },
}

impl fmt::Display for OracleConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleConfigError::MissingEnv { key } => write!(f, "missing env variable: {key}"),
            OracleConfigError::EmptyEnv { key } => write!(f, "empty env variable: {key}"),
            OracleConfigError::InvalidTimeout { value } => {
                write!(f, "invalid timeout value: {value}")
            }
            OracleConfigError::ReadConfigFile { path, message } => {
                write!(f, "read config file failed ({path}): {message}")
            }
            OracleConfigError::ParseConfigFile { path, message } => {
                write!(f, "parse config file failed ({path}): {message}")
            }
        }
    }
}

impl Error for OracleConfigError {}

/// One action the actor may take, summarized for the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionBrief {
    pub name: String,
    pub description: String,
    pub required_params: Vec<String>,
}

/// One space the actor belongs to, summarized for the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceBrief {
    pub id: String,
    pub name: String,
    pub type_name: String,
    pub member_count: usize,
    pub supported_actions: Vec<String>,
}

/// Everything the oracle gets to see for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub actor_id: String,
    pub persona: String,
    pub actions: Vec<ActionBrief>,
    pub spaces: Vec<SpaceBrief>,
    pub history: String,
}

/// The oracle's proposal for the actor's next action.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OracleReply {
    pub action: String,
    pub context_id: Option<String>,
    pub parent_id: Option<String>,
    pub recipients: Option<Vec<String>>,
    pub params: serde_json::Map<String, serde_json::Value>,
}

pub trait ActionOracle {
    fn propose(&self, request: &TurnRequest) -> Result<OracleReply, OracleClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleClientError {
    BuildClient { message: String },
    Timeout,
    Http { message: String },
    HttpStatus { code: u16, message: String },
    DecodeResponse { message: String },
    EmptyChoice,
    MalformedReply { message: String },
}

impl fmt::Display for OracleClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleClientError::BuildClient { message } => {
                write!(f, "client build failed: {message}")
            }
            OracleClientError::Timeout => write!(f, "oracle request timed out"),
            OracleClientError::Http { message } => write!(f, "http request failed: {message}"),
            OracleClientError::HttpStatus { code, message } => {
                write!(f, "http status {code}: {message}")
            }
            OracleClientError::DecodeResponse { message } => {
                write!(f, "decode response failed: {message}")
            }
            OracleClientError::EmptyChoice => write!(f, "empty completion choice"),
            OracleClientError::MalformedReply { message } => {
                write!(f, "malformed oracle reply: {message}")
            }
        }
    }
}

impl Error for OracleClientError {}

#[derive(Debug, Clone)]
pub struct OpenAiChatOracle {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    client: Client,
}

impl OpenAiChatOracle {
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleClientError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|err| OracleClientError::BuildClient {
                message: err.to_string(),
            })?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: DEFAULT_ORACLE_TEMPERATURE,
            client,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl ActionOracle for OpenAiChatOracle {
    fn propose(&self, request: &TurnRequest) -> Result<OracleReply, OracleClientError> {
        let url = format!("{}/chat/completions", self.base_url);
        let system_prompt = system_prompt(request);
        let user_prompt = user_prompt(request);
        let payload = ChatCompletionRequest {
            model: self.model.as_str(),
            temperature: self.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt.as_str(),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt.as_str(),
                },
            ],
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    OracleClientError::Timeout
                } else {
                    OracleClientError::Http {
                        message: err.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().unwrap_or_else(|_| "<no body>".to_string());
            return Err(OracleClientError::HttpStatus {
                code: status.as_u16(),
                message,
            });
        }

        let response: ChatCompletionResponse =
            response
                .json()
                .map_err(|err| OracleClientError::DecodeResponse {
                    message: err.to_string(),
                })?;

        let first = response
            .choices
            .into_iter()
            .next()
            .ok_or(OracleClientError::EmptyChoice)?;

        parse_oracle_reply(first.message.content.as_str())
    }
}

fn system_prompt(request: &TurnRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str(&request.persona);
    prompt.push_str("\n\nYou are ");
    prompt.push_str(&request.actor_id);
    prompt.push_str(" in a shared workspace. Decide your next action.\n\n");
    prompt.push_str("AVAILABLE ACTIONS (use exactly these names):\n");
    for action in &request.actions {
        if action.required_params.is_empty() {
            prompt.push_str(&format!("- {}: {}\n", action.name, action.description));
        } else {
            prompt.push_str(&format!(
                "- {}: {} (requires: {})\n",
                action.name,
                action.description,
                action.required_params.join(", ")
            ));
        }
    }
    prompt.push_str(
        "\nReply with a single JSON object and no other text:\n\
{\"action\": \"<name>\", \"contextId\": \"<space id>\", \"parameters\": {}}\n\
Omit contextId for actions that need no space. Put every required parameter \
inside \"parameters\".",
    );
    prompt
}

fn user_prompt(request: &TurnRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str(&request.history);
    prompt.push_str("\nYour accessible spaces and what actions they support:\n");
    if request.spaces.is_empty() {
        prompt.push_str("- (none yet)\n");
    }
    for space in &request.spaces {
        prompt.push_str(&format!(
            "- {} (name: {}, type: {}, {} members): supports {}\n",
            space.id,
            space.name,
            space.type_name,
            space.member_count,
            if space.supported_actions.is_empty() {
                "nothing".to_string()
            } else {
                space.supported_actions.join(", ")
            }
        ));
    }
    prompt.push_str("\nRespond now with the JSON object only.");
    prompt
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyPayload {
    #[serde(default)]
    action: String,
    #[serde(default)]
    context_id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    recipients: Option<Vec<String>>,
    #[serde(default)]
    parameters: serde_json::Map<String, serde_json::Value>,
}

/// Parses the oracle's raw completion into a reply.
///
/// Models often wrap the object in prose or code fences, so the first `{` to
/// the last `}` is taken as the candidate. `parentId` and `recipients` are
/// accepted either at the top level or inside `parameters`.
pub fn parse_oracle_reply(raw: &str) -> Result<OracleReply, OracleClientError> {
    let json = extract_json_block(raw).unwrap_or(raw);
    let payload = serde_json::from_str::<ReplyPayload>(json).map_err(|err| {
        OracleClientError::MalformedReply {
            message: format!("json parse failed: {err}"),
        }
    })?;

    let params = payload.parameters;
    let context_id = payload.context_id.or_else(|| {
        params
            .get("contextId")
            .and_then(|value| value.as_str())
            .map(str::to_string)
    });
    let parent_id = payload.parent_id.or_else(|| {
        params
            .get("parentId")
            .and_then(|value| value.as_str())
            .map(str::to_string)
    });
    let recipients = payload.recipients.or_else(|| {
        params.get("recipients").and_then(|value| {
            value.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
        })
    });

    Ok(OracleReply {
        action: payload.action,
        context_id,
        parent_id,
        recipients,
        params,
    })
}

fn extract_json_block(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    raw.get(start..=end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn getter<'a>(map: &'a BTreeMap<&'a str, &'a str>) -> impl FnMut(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|value| value.to_string())
    }

    #[test]
    fn config_reads_all_keys() {
        let mut map = BTreeMap::new();
        map.insert(ENV_ORACLE_MODEL, "gpt-4o-mini");
        map.insert(ENV_ORACLE_BASE_URL, "https://api.example.com/v1");
        map.insert(ENV_ORACLE_API_KEY, "sk-test");
        map.insert(ENV_ORACLE_TIMEOUT_MS, "1200");

        let config = OracleConfig::from_env_with(getter(&map)).unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.base_url, "https://api.example.com/v1");
        assert_eq!(config.timeout_ms, 1200);
    }

    #[test]
    fn config_defaults_timeout() {
        let mut map = BTreeMap::new();
        map.insert(ENV_ORACLE_MODEL, "m");
        map.insert(ENV_ORACLE_BASE_URL, "https://api.example.com");
        map.insert(ENV_ORACLE_API_KEY, "k");

        let config = OracleConfig::from_env_with(getter(&map)).unwrap();
        assert_eq!(config.timeout_ms, DEFAULT_ORACLE_TIMEOUT_MS);
    }

    #[test]
    fn config_rejects_missing_and_empty_keys() {
        let map = BTreeMap::new();
        let err = OracleConfig::from_env_with(getter(&map)).unwrap_err();
        assert_eq!(
            err,
            OracleConfigError::MissingEnv {
                key: ENV_ORACLE_MODEL
            }
        );

        let mut map = BTreeMap::new();
        map.insert(ENV_ORACLE_MODEL, "   ");
        let err = OracleConfig::from_env_with(getter(&map)).unwrap_err();
        assert_eq!(
            err,
            OracleConfigError::EmptyEnv {
                key: ENV_ORACLE_MODEL
            }
        );
    }

    #[test]
    fn config_rejects_bad_timeout() {
        let mut map = BTreeMap::new();
        map.insert(ENV_ORACLE_MODEL, "m");
        map.insert(ENV_ORACLE_BASE_URL, "u");
        map.insert(ENV_ORACLE_API_KEY, "k");
        map.insert(ENV_ORACLE_TIMEOUT_MS, "soon");

        let err = OracleConfig::from_env_with(getter(&map)).unwrap_err();
        assert_eq!(
            err,
            OracleConfigError::InvalidTimeout {
                value: "soon".to_string()
            }
        );
    }

    #[test]
    fn reply_parses_from_fenced_output() {
        let raw = "Sure, here you go:\n```json\n{\"action\": \"post_message\", \"contextId\": \"s-general\", \"parameters\": {\"message\": \"hi\"}}\n```";
        let reply = parse_oracle_reply(raw).unwrap();
        assert_eq!(reply.action, "post_message");
        assert_eq!(reply.context_id.as_deref(), Some("s-general"));
        assert_eq!(
            reply.params.get("message").and_then(|v| v.as_str()),
            Some("hi")
        );
    }

    #[test]
    fn reply_lifts_parent_and_recipients_from_parameters() {
        let raw = r#"{"action": "send_dm", "parameters": {"parentId": "evt_1", "recipients": ["a-ravi", "a-lena"], "message": "ping"}}"#;
        let reply = parse_oracle_reply(raw).unwrap();
        assert_eq!(reply.parent_id.as_deref(), Some("evt_1"));
        assert_eq!(
            reply.recipients,
            Some(vec!["a-ravi".to_string(), "a-lena".to_string()])
        );
        // The lifted keys stay in params; they flow into event metadata.
        assert!(reply.params.contains_key("parentId"));
    }

    #[test]
    fn reply_prefers_top_level_fields() {
        let raw = r#"{"action": "send_dm", "contextId": "s-top", "parameters": {"contextId": "s-nested"}}"#;
        let reply = parse_oracle_reply(raw).unwrap();
        assert_eq!(reply.context_id.as_deref(), Some("s-top"));
    }

    #[test]
    fn reply_rejects_non_json() {
        let err = parse_oracle_reply("I would rather not decide today.").unwrap_err();
        assert!(matches!(err, OracleClientError::MalformedReply { .. }));
    }

    #[test]
    fn prompts_mention_actions_and_spaces() {
        let request = TurnRequest {
            actor_id: "a-maya".to_string(),
            persona: "You are Maya, a product manager.".to_string(),
            actions: vec![ActionBrief {
                name: "post_message".to_string(),
                description: "Post a message".to_string(),
                required_params: vec!["contextId".to_string(), "message".to_string()],
            }],
            spaces: vec![SpaceBrief {
                id: "s-general".to_string(),
                name: "general".to_string(),
                type_name: "Channel".to_string(),
                member_count: 3,
                supported_actions: vec!["post_message".to_string()],
            }],
            history: "Recent activity you can see:\n".to_string(),
        };
        let system = system_prompt(&request);
        assert!(system.contains("post_message: Post a message (requires: contextId, message)"));
        let user = user_prompt(&request);
        assert!(user.contains("s-general (name: general, type: Channel, 3 members)"));
    }
}
