//! Isolated script evaluator for token snippets.
//!
//! Each [`Sandbox`] owns its own `boa_engine` context. The global object is
//! exposed as `window`, and the browser APIs the obfuscated snippets touch
//! are replaced by inert stand-ins so unrelated calls do not throw.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use boa_engine::{
    js_string, Context, JsArgs, JsNativeError, JsResult, JsString, JsValue, NativeFunction,
    Source,
};
use serde_json::Value;

use crate::token::extract::TokenError;

const LOOP_ITERATION_LIMIT: u64 = 1_000_000;

const BROWSER_STUBS: &str = r#"
var window = globalThis;
window.Map = function(_i){ };
window.setTimeout = function(_f,_t){ };
window.setInterval = function(_f,_t){ };
window.encodeURIComponent = window.Map;
window.document = { };
document.doctype = { };
document.currentScript = { };
document.getElementById = window.Map;
document.prepend = window.Map;
document.append = window.Map;
document.appendChild = window.Map;
"#;

pub struct Sandbox {
    context: Context,
}

impl Sandbox {
    pub fn new() -> Result<Self, TokenError> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
        context
            .register_global_callable(js_string!("atob"), 1, NativeFunction::from_fn_ptr(atob))
            .map_err(execution_error)?;
        context
            .eval(Source::from_bytes(BROWSER_STUBS))
            .map_err(execution_error)?;
        Ok(Self { context })
    }

    /// Runs `code` in the sandbox, discarding its completion value.
    pub fn exec(&mut self, code: &str) -> Result<(), TokenError> {
        self.context
            .eval(Source::from_bytes(code))
            .map(|_| ())
            .map_err(execution_error)
    }

    /// Reads `window[name]`. `None` when the property is undefined.
    pub fn get_var(&mut self, name: &str) -> Result<Option<Value>, TokenError> {
        let value = self.window_property(name)?;
        if value.is_undefined() {
            return Ok(None);
        }
        value
            .to_json(&mut self.context)
            .map(Some)
            .map_err(execution_error)
    }

    /// Reads `window[name]` coerced to a string. `None` when undefined.
    pub fn get_string(&mut self, name: &str) -> Result<Option<String>, TokenError> {
        let value = self.window_property(name)?;
        if value.is_undefined() || value.is_null() {
            return Ok(None);
        }
        let text = value.to_string(&mut self.context).map_err(execution_error)?;
        Ok(Some(text.to_std_string_escaped()))
    }

    fn window_property(&mut self, name: &str) -> Result<JsValue, TokenError> {
        let key = serde_json::to_string(name).map_err(|err| TokenError::Execution {
            message: err.to_string(),
        })?;
        self.context
            .eval(Source::from_bytes(&format!("window[{key}]")))
            .map_err(execution_error)
    }
}

fn execution_error(err: boa_engine::JsError) -> TokenError {
    TokenError::Execution {
        message: err.to_string(),
    }
}

fn atob(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let encoded = args
        .get_or_undefined(0)
        .to_string(context)?
        .to_std_string_escaped();
    let raw = BASE64_STANDARD.decode(encoded.trim()).map_err(|err| {
        JsNativeError::typ().with_message(format!("atob: invalid base64: {err}"))
    })?;
    let decoded = String::from_utf8_lossy(&raw);
    Ok(JsValue::from(JsString::from(decoded.as_ref())))
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::Sandbox;

    #[test]
    fn atob_decodes_base64() {
        let mut sandbox = Sandbox::new().expect("sandbox");
        sandbox
            .exec("window.decoded = atob('QEhlbGxvIFdvcmxkIQ==');")
            .expect("exec");
        assert_eq!(
            sandbox.get_string("decoded").expect("read").as_deref(),
            Some("@Hello World!")
        );
    }

    #[test]
    fn browser_stubs_are_truthy() {
        let mut sandbox = Sandbox::new().expect("sandbox");
        sandbox
            .exec(
                r#"
                window.t0 =
                    window['document']&&
                    !window[["p","Ma"].reverse().join('')]||
                    !window[["ut","meo","i","etT","s"].reverse().join('')];
                window.t1 = Boolean(window['document']);
                window.t2 = Boolean(!window[["p","Ma"].reverse().join('')]);
                "#,
            )
            .expect("exec");

        assert_eq!(sandbox.get_var("t0").expect("t0"), Some(Value::Bool(false)));
        assert_eq!(sandbox.get_var("t1").expect("t1"), Some(Value::Bool(true)));
        assert_eq!(sandbox.get_var("t2").expect("t2"), Some(Value::Bool(false)));
    }

    #[test]
    fn undefined_variable_reads_as_none() {
        let mut sandbox = Sandbox::new().expect("sandbox");
        assert_eq!(sandbox.get_var("AJAX_TOKEN").expect("read"), None);
        assert_eq!(sandbox.get_string("AJAX_TOKEN").expect("read"), None);
    }

    #[test]
    fn script_errors_surface_as_execution_errors() {
        let mut sandbox = Sandbox::new().expect("sandbox");
        assert!(sandbox.exec("undefinedFunction();").is_err());
        assert!(sandbox.exec("window.x = atob('***');").is_err());
    }

    #[test]
    fn sandboxes_do_not_share_state() {
        let mut first = Sandbox::new().expect("sandbox");
        first.exec("window.shared = 'first';").expect("exec");
        let mut second = Sandbox::new().expect("sandbox");
        assert_eq!(second.get_string("shared").expect("read"), None);
    }
}
