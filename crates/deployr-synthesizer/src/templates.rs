//! Embedded templates for the generated build units. Placeholders use the
//! `{{NAME}}` form and are substituted by `render`.

use std::collections::HashMap;

pub const PYTHON_WRAPPER_TEMPLATE: &str = r#"import sys
import json
import traceback
from flask import Flask, request, jsonify

from main import {{APP_NAME}}
from main import {{FUNCTION_NAME}}


def handle_event(event):
    function_name = '{{FUNCTION_NAME}}'
    method = event.get('method', 'GET')
    headers = event.get('headers', {}) or {}
    query_params = event.get('queryParams', {}) or {}
    body = event.get('body')

    try:
        data = None
        if body is not None:
            data = body if isinstance(body, str) else json.dumps(body)
        with {{APP_NAME}}.test_request_context(
            event.get('path', '{{FUNCTION_PATH}}'),
            method=method,
            headers=headers,
            query_string=query_params,
            data=data,
        ):
            result = {{FUNCTION_NAME}}({{FUNCTION_ARGS}})

        # Flask (payload, status) tuple
        if isinstance(result, tuple) and len(result) == 2 and isinstance(result[0], dict):
            return {'statusCode': result[1], 'headers': {'Content-Type': 'application/json'}, 'body': json.dumps(result[0])}
        # Flask Response object
        if hasattr(result, 'get_data'):
            return {'statusCode': result.status_code, 'headers': dict(result.headers), 'body': result.get_data(as_text=True)}
        if isinstance(result, dict):
            return {'statusCode': 200, 'headers': {'Content-Type': 'application/json'}, 'body': json.dumps(result)}
        return {'statusCode': 200, 'headers': {'Content-Type': 'text/plain'}, 'body': str(result)}
    except Exception as e:
        error_msg = f'Error executing function {function_name}: {str(e)}'
        details = traceback.format_exc()
        print(error_msg, file=sys.stderr)
        print(details, file=sys.stderr)
        return {'statusCode': 500, 'headers': {'Content-Type': 'application/json'}, 'body': json.dumps({'error': error_msg, 'details': details})}


if __name__ == '__main__':
    raw_event = sys.argv[1] if len(sys.argv) > 1 else '{}'
    print(json.dumps(handle_event(json.loads(raw_event))))
"#;

pub const PYTHON_ADAPTER_TEMPLATE: &str = r#"import json


def normalize_response(result):
    """Coerce any handler return value into an event-style response dict."""
    if isinstance(result, dict) and 'statusCode' in result:
        return result
    if isinstance(result, tuple) and len(result) == 2:
        payload, status = result
        body = payload if isinstance(payload, str) else json.dumps(payload)
        return {'statusCode': status, 'headers': {'Content-Type': 'application/json'}, 'body': body}
    if hasattr(result, 'get_data'):
        return {
            'statusCode': result.status_code,
            'headers': dict(result.headers),
            'body': result.get_data(as_text=True),
        }
    body = result if isinstance(result, str) else json.dumps(result)
    return {'statusCode': 200, 'headers': {'Content-Type': 'application/json'}, 'body': body}
"#;

pub const PYTHON_INIT_TEMPLATE: &str = r#"from .adapter import normalize_response

__all__ = ['normalize_response']
"#;

pub const PYTHON_DOCKERFILE_TEMPLATE: &str = r#"FROM python:3.11-slim

WORKDIR /app

COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt

COPY . .

# Function: {{FUNCTION_NAME}}
ENV PYTHONUNBUFFERED=1

CMD ["python", "-u", "function_wrapper.py"]
"#;

/// Substitute `{{KEY}}` placeholders. Unknown placeholders are left as-is
/// so a template mistake is visible in the emitted artifact.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_all_occurrences() {
        let mut vars = HashMap::new();
        vars.insert("FUNCTION_NAME", "get_books".to_string());
        let out = render("def {{FUNCTION_NAME}}(): pass  # {{FUNCTION_NAME}}", &vars);
        assert_eq!(out, "def get_books(): pass  # get_books");
    }

    #[test]
    fn render_leaves_unknown_placeholders_visible() {
        let out = render("{{MISSING}}", &HashMap::new());
        assert_eq!(out, "{{MISSING}}");
    }

    #[test]
    fn wrapper_template_has_no_stray_placeholders_after_render() {
        let mut vars = HashMap::new();
        vars.insert("APP_NAME", "app".to_string());
        vars.insert("FUNCTION_NAME", "books".to_string());
        vars.insert("FUNCTION_PATH", "/books".to_string());
        vars.insert("FUNCTION_ARGS", String::new());
        let out = render(PYTHON_WRAPPER_TEMPLATE, &vars);
        assert!(!out.contains("{{"));
        assert!(out.contains("from main import app"));
    }
}
