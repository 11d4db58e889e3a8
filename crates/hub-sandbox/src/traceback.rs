//! Error messages attributable to the entity's own source

const TRACEBACK_MARKER: &str = "stack traceback:";

/// Split an mlua error into a message and the frames that belong to `chunk_name`
///
/// Frames from native functions (`[C]`), from the hub's own helpers and tail
/// call markers are dropped.
pub(crate) fn clean(err: &mlua::Error, chunk_name: &str) -> (String, Vec<String>) {
    let (message, traceback) = split(err);
    let prefix = format!("{}:", chunk_name);
    let frames = traceback
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    (message.trim().to_string(), frames)
}

fn split(err: &mlua::Error) -> (String, String) {
    match err {
        mlua::Error::CallbackError { traceback, cause } => {
            let (message, inner) = split(cause);
            let traceback = if inner.is_empty() {
                traceback.clone()
            } else {
                inner
            };
            (message, traceback)
        }
        mlua::Error::RuntimeError(text) => match text.split_once(TRACEBACK_MARKER) {
            Some((message, traceback)) => (message.to_string(), traceback.to_string()),
            None => (text.clone(), String::new()),
        },
        mlua::Error::SyntaxError { message, .. } => (message.clone(), String::new()),
        mlua::Error::ExternalError(inner) => (inner.to_string(), String::new()),
        other => (other.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_frames_are_dropped() {
        let err = mlua::Error::RuntimeError(
            "lamp:3: boom\nstack traceback:\n\t[C]: in function 'error'\n\tlamp:3: in function 'explode'\n\t(...tail calls...)\n\thub:1: in ?\n\tlamp:7: in function 'on'"
                .to_string(),
        );
        let (message, frames) = clean(&err, "lamp");
        assert_eq!(message, "lamp:3: boom");
        assert_eq!(
            frames,
            vec!["lamp:3: in function 'explode'", "lamp:7: in function 'on'"]
        );
    }

    #[test]
    fn test_callback_error_uses_cause_message() {
        let err = mlua::Error::CallbackError {
            traceback: "stack traceback:\n\t[C]: in function 'sendEvent'\n\tlamp:2: in function 'on'"
                .to_string(),
            cause: std::sync::Arc::new(mlua::Error::RuntimeError("sendEvent needs a name".to_string())),
        };
        let (message, frames) = clean(&err, "lamp");
        assert_eq!(message, "sendEvent needs a name");
        assert_eq!(frames, vec!["lamp:2: in function 'on'"]);
    }
}
