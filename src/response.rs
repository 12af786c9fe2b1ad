use serde::{Deserialize, Serialize};

/// The result of one module function call.
///
/// `data` is opaque to the engine. By convention modules put JSON in it, but
/// nothing on the transport path parses it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    /// Set when the call mutated at least one host.
    pub modified: bool,
    pub func_name: String,
    pub error_msg: String,
    pub data: Vec<u8>,
}

impl Response {
    /// A successful empty response.
    pub fn ok(func_name: impl Into<String>) -> Response {
        Response {
            success: true,
            func_name: func_name.into(),
            ..Response::default()
        }
    }

    /// A failed response carrying an error message.
    pub fn fail(func_name: impl Into<String>, msg: impl Into<String>) -> Response {
        Response {
            success: false,
            func_name: func_name.into(),
            error_msg: msg.into(),
            ..Response::default()
        }
    }

    /// Merges `rsp` into this response: success is AND-ed, modified is
    /// OR-ed, error messages are newline-joined, data is concatenated in
    /// append order.
    pub fn append(&mut self, rsp: Response) {
        if !rsp.success {
            self.success = false;
        }
        if rsp.modified {
            self.modified = true;
        }
        if !rsp.error_msg.is_empty() {
            if self.error_msg.is_empty() {
                self.error_msg = rsp.error_msg;
            } else {
                self.error_msg.push('\n');
                self.error_msg.push_str(&rsp.error_msg);
            }
        }
        self.data.extend_from_slice(&rsp.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_folds() {
        let mut acc = Response::ok("f");
        acc.append(Response {
            success: true,
            modified: false,
            func_name: "f".into(),
            error_msg: String::new(),
            data: b"ab".to_vec(),
        });
        assert!(acc.success);
        assert!(!acc.modified);

        acc.append(Response {
            success: false,
            modified: true,
            func_name: "f".into(),
            error_msg: "boom".into(),
            data: b"cd".to_vec(),
        });
        assert!(!acc.success);
        assert!(acc.modified);
        assert_eq!(acc.error_msg, "boom");
        assert_eq!(acc.data, b"abcd");

        // success never comes back, messages accumulate in order
        acc.append(Response {
            success: true,
            modified: false,
            func_name: "f".into(),
            error_msg: "again".into(),
            data: b"e".to_vec(),
        });
        assert!(!acc.success);
        assert_eq!(acc.error_msg, "boom\nagain");
        assert_eq!(acc.data, b"abcde");
    }
}
