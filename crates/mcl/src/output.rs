use serde::Serialize;

/// Prints command results either for people or as one JSON object per line.
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    pub fn success<T: Serialize>(&self, command: &str, data: T) {
        if self.json {
            let response = JsonResponse {
                status: "ok",
                command,
                data: Some(data),
                error: None,
            };
            println!("{}", to_json(&response, false));
        } else {
            println!("{}", to_json(&data, true));
        }
    }

    /// Human output is the bare message.
    pub fn success_message(&self, command: &str, message: &str) {
        if self.json {
            let response = JsonResponse {
                status: "ok",
                command,
                data: Some(serde_json::json!({ "message": message })),
                error: None,
            };
            println!("{}", to_json(&response, false));
        } else {
            println!("{}", message);
        }
    }

    /// Prints preformatted text in human mode and `data` in JSON mode.
    pub fn success_text<T: Serialize>(&self, command: &str, text: &str, data: T) {
        if self.json {
            self.success(command, data);
        } else {
            print!("{}", text);
        }
    }

    pub fn error(&self, message: &str) {
        if self.json {
            let response: JsonResponse<()> = JsonResponse {
                status: "error",
                command: "",
                data: None,
                error: Some(message.to_string()),
            };
            eprintln!("{}", to_json(&response, false));
        } else {
            eprintln!("Error: {}", message);
        }
    }
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> String {
    let result = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    result.unwrap_or_else(|e| format!("{{\"status\":\"error\",\"error\":\"{}\"}}", e))
}

#[derive(Serialize)]
struct JsonResponse<'a, T: Serialize> {
    status: &'a str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}
