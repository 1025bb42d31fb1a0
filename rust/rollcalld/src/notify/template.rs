use std::collections::HashMap;

pub const PLACEHOLDERS: [&str; 6] = [
    "studentName",
    "parentName",
    "className",
    "date",
    "status",
    "schoolName",
];

/// Replaces `{key}` for known keys. Anything else is left untouched.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match vars.get(key) {
                    Some(v) if PLACEHOLDERS.contains(&key) => out.push_str(v),
                    _ => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
