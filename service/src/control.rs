//! Named-operation control surface.
//!
//! Requests are JSON objects naming a method plus its camelCase arguments,
//! e.g. `{"method":"write","connectionId":"AA:BB:CC:DD:EE:FF","data":[1,2]}`.
//! Replies are either `{"ok":<value>}` or
//! `{"error":{"code":"...","message":"..."}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::VariantNames;

use crate::{
   bluetooth::adapter::RadioAdapter,
   connection::ConnectionManager,
   error::BtError,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, strum::VariantNames)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Request {
   IsAvailable,
   IsEnabled,
   IsDiscovering,
   StartDiscovery,
   CancelDiscovery,
   GetBondedDevices,
   Connect { address: String },
   Disconnect { connection_id: String },
   Write { connection_id: String, data: Vec<u8> },
}

impl Request {
   /// Parses a request, telling unknown methods apart from bad arguments.
   pub fn parse(json: &str) -> Result<Self, ControlError> {
      let value: Value = serde_json::from_str(json)
         .map_err(|e| ControlError::invalid_argument(format!("malformed request: {e}")))?;
      let method = value
         .get("method")
         .and_then(Value::as_str)
         .ok_or_else(|| ControlError::invalid_argument("missing method"))?;
      if !Self::VARIANTS.contains(&method) {
         return Err(ControlError::not_implemented(method));
      }
      serde_json::from_value(value).map_err(|e| ControlError::invalid_argument(e.to_string()))
   }
}

/// Error half of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlError {
   pub code: String,
   pub message: String,
}

impl ControlError {
   fn new(code: &str, message: impl Into<String>) -> Self {
      Self {
         code: code.to_owned(),
         message: message.into(),
      }
   }

   pub fn invalid_argument(message: impl Into<String>) -> Self {
      Self::new("invalid_argument", message)
   }

   pub fn not_implemented(method: &str) -> Self {
      Self::new("not_implemented", format!("unknown method {method:?}"))
   }
}

impl From<BtError> for ControlError {
   fn from(e: BtError) -> Self {
      Self::new(e.code(), e.to_string())
   }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
   Ok(Value),
   Error(ControlError),
}

impl From<Result<Value, ControlError>> for Reply {
   fn from(result: Result<Value, ControlError>) -> Self {
      match result {
         Ok(value) => Self::Ok(value),
         Err(e) => Self::Error(e),
      }
   }
}

/// Runs `request` against `manager`.
pub async fn dispatch<A: RadioAdapter>(
   manager: &ConnectionManager<A>,
   request: Request,
) -> Result<Value, ControlError> {
   let value = match request {
      Request::IsAvailable => Value::Bool(manager.is_available()),
      Request::IsEnabled => Value::Bool(manager.is_enabled().await?),
      Request::IsDiscovering => Value::Bool(manager.is_discovering().await?),
      Request::StartDiscovery => {
         manager.start_discovery().await?;
         Value::Null
      },
      Request::CancelDiscovery => {
         manager.cancel_discovery().await?;
         Value::Null
      },
      Request::GetBondedDevices => {
         serde_json::to_value(manager.bonded_devices().await?).map_err(BtError::from)?
      },
      Request::Connect { address } => Value::String(manager.connect(&address).await?.into()),
      Request::Disconnect { connection_id } => {
         manager.disconnect(&connection_id).await?;
         Value::Null
      },
      Request::Write {
         connection_id,
         data,
      } => {
         manager.write(&connection_id, &data).await?;
         Value::Null
      },
   };
   Ok(value)
}

/// Parses, runs and encodes one request.
pub async fn handle_json<A: RadioAdapter>(manager: &ConnectionManager<A>, json: &str) -> String {
   let result = match Request::parse(json) {
      Ok(request) => dispatch(manager, request).await,
      Err(e) => Err(e),
   };
   let reply = Reply::from(result);
   serde_json::to_string(&reply).unwrap_or_else(|e| {
      format!(r#"{{"error":{{"code":"internal_error","message":"{e}"}}}}"#)
   })
}
