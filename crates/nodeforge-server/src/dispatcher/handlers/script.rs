//! Script-execution handler (§4.7): invokes a host-registered named callable by name.
//! No arbitrary code ever reaches this path — only names already in the registry are
//! reachable, matching the trust boundary the distilled spec draws around this
//! command.

use serde::Deserialize;
use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::Result;

#[derive(Debug, Deserialize)]
pub struct ExecuteScriptParams {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

pub async fn execute_script(dispatcher: &Dispatcher, params: ExecuteScriptParams) -> Result<Value> {
    let result = dispatcher.scripts.call(&params.name, params.args)?;
    Ok(serde_json::json!({"result": result}))
}
