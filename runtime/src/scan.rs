//! Reading function signatures and attributes out of a canonically printed
//! module.
//!
//! The compilation context works against the canonical text form the IR
//! printer produces for a parsed, verified module: one `func.func` header per
//! line, attributes in dictionary syntax. Scanning that form keeps entry
//! resolution and attribute handling independent of binding introspection
//! and directly testable.

use crate::custom_call::AttrValue;
use crate::error::{EntrypointNotFoundSnafu, Result};

/// Argument attribute requesting specialization before compilation.
pub const SPECIALIZE_ATTR: &str = "rt.specialize";
/// Function attribute redirecting the entry point to another symbol.
pub const ENTRYPOINT_ATTR: &str = "rt.entrypoint";
/// Function attribute binding a declaration to a registered custom call.
pub const CUSTOM_CALL_ATTR: &str = "rt.custom_call";
/// Function attribute dictionary carrying declared custom call attributes.
pub const CUSTOM_CALL_ATTRS_ATTR: &str = "rt.attrs";

/// A parsed attribute value in IR syntax.
#[derive(Debug, Clone, PartialEq)]
pub enum ScannedAttr {
    /// `"text"`
    Str(String),
    /// `1 : i32` (value, type)
    Int(i64, String),
    /// `1.0 : f32` (value, type)
    Float(f64, String),
    /// `@symbol`
    Symbol(String),
    /// `{key = value, ...}`
    Dict(Vec<(String, ScannedAttr)>),
    /// Anything else, kept verbatim.
    Other(String),
}

impl ScannedAttr {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// Convert to a custom call attribute value, dispatching on the declared
    /// scalar type.
    pub fn to_attr_value(&self) -> Option<AttrValue> {
        match self {
            Self::Str(value) => Some(AttrValue::Str(value.clone())),
            Self::Int(value, ty) => match ty.as_str() {
                "i32" => Some(AttrValue::I32(*value as i32)),
                "i64" | "index" => Some(AttrValue::I64(*value)),
                _ => None,
            },
            Self::Float(value, ty) => match ty.as_str() {
                "f32" => Some(AttrValue::F32(*value as f32)),
                "f64" => Some(AttrValue::F64(*value)),
                _ => None,
            },
            _ => None,
        }
    }
}

/// One entry point parameter: printed type plus argument attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    pub ty: String,
    pub attrs: Vec<(String, ScannedAttr)>,
}

/// Specialization constraint declared on a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Dynamic dimensions must be replaced with operand shapes.
    Shape,
    /// The operand value must be sunk into the function body.
    Value,
}

impl ParamInfo {
    pub fn constraint(&self) -> Option<Constraint> {
        let (_, attr) = self.attrs.iter().find(|(name, _)| name == SPECIALIZE_ATTR)?;
        match attr.as_str()? {
            "shape" => Some(Constraint::Shape),
            "value" => Some(Constraint::Value),
            _ => None,
        }
    }
}

/// A `func.func` header scanned from the canonical module text.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncInfo {
    pub name: String,
    pub is_private: bool,
    pub is_declaration: bool,
    pub params: Vec<ParamInfo>,
    pub results: Vec<String>,
    pub attrs: Vec<(String, ScannedAttr)>,
}

impl FuncInfo {
    pub fn attr(&self, name: &str) -> Option<&ScannedAttr> {
        self.attrs.iter().find(|(key, _)| key == name).map(|(_, attr)| attr)
    }

    pub fn operand_types(&self) -> Vec<String> {
        self.params.iter().map(|param| param.ty.clone()).collect()
    }

    /// True if any parameter requires specialization before compilation.
    pub fn requires_specialization(&self) -> bool {
        self.params.iter().any(|param| param.constraint().is_some())
    }

    /// The custom call key if this is a bridged intrinsic declaration.
    pub fn custom_call_key(&self) -> Option<&str> {
        self.attr(CUSTOM_CALL_ATTR)?.as_str()
    }

    /// Declared custom call attributes (`rt.attrs` dictionary).
    pub fn custom_call_attrs(&self) -> Vec<(String, AttrValue)> {
        let Some(ScannedAttr::Dict(entries)) = self.attr(CUSTOM_CALL_ATTRS_ATTR) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|(name, attr)| Some((name.clone(), attr.to_attr_value()?)))
            .collect()
    }
}

/// Everything the runtime needs to know about a module's functions.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub functions: Vec<FuncInfo>,
}

impl ModuleInfo {
    pub fn function(&self, name: &str) -> Option<&FuncInfo> {
        self.functions.iter().find(|func| func.name == name)
    }

    /// Resolve the entry point, following the alternate entry indirection:
    /// if the named function carries `rt.entrypoint = @other`, `@other`
    /// becomes the true entry.
    pub fn resolve_entrypoint(&self, entrypoint: &str) -> Result<&FuncInfo> {
        let func = self
            .function(entrypoint)
            .ok_or(())
            .or_else(|()| EntrypointNotFoundSnafu { name: entrypoint.to_string() }.fail())?;

        if let Some(target) = func.attr(ENTRYPOINT_ATTR).and_then(|attr| attr.as_symbol()) {
            return self
                .function(target)
                .ok_or(())
                .or_else(|()| EntrypointNotFoundSnafu { name: target.to_string() }.fail());
        }
        Ok(func)
    }

    /// Intrinsic declarations bound to custom calls.
    pub fn custom_call_declarations(&self) -> impl Iterator<Item = &FuncInfo> {
        self.functions.iter().filter(|func| func.is_declaration && func.custom_call_key().is_some())
    }
}

/// Scan the canonical text of a module.
pub fn scan_module(text: &str) -> ModuleInfo {
    let mut functions = Vec::new();
    for line in text.lines() {
        if let Some(func) = parse_func_header(line.trim()) {
            functions.push(func);
        }
    }
    ModuleInfo { functions }
}

// ---------------------------------------------------------------------------
// Text helpers. All of them treat `<>()[]{}` as nesting and `"` as strings.
// ---------------------------------------------------------------------------

fn is_open(c: char) -> bool {
    matches!(c, '<' | '(' | '[' | '{')
}

fn is_close(c: char) -> bool {
    matches!(c, '>' | ')' | ']' | '}')
}

/// Iterate characters with their top-level flag (depth 0, outside strings).
fn top_level_positions(s: &str) -> Vec<(usize, char, bool)> {
    let mut positions = Vec::with_capacity(s.len());
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, c) in s.char_indices() {
        let top = depth == 0 && !in_string;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            positions.push((index, c, false));
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                positions.push((index, c, top));
            }
            c if is_open(c) => {
                positions.push((index, c, top));
                depth += 1;
            }
            c if is_close(c) => {
                depth = depth.saturating_sub(1);
                positions.push((index, c, depth == 0));
            }
            _ => positions.push((index, c, top)),
        }
    }
    positions
}

/// Split on a separator at nesting depth zero.
pub fn split_top_level(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    for (index, c, top) in top_level_positions(s) {
        if top && c == separator {
            parts.push(&s[start..index]);
            start = index + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Byte offset of the matching close bracket for the open bracket at `open`.
fn find_matching(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, c) in s[open..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if is_open(c) => depth += 1,
            c if is_close(c) => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + index);
                }
            }
            _ => {}
        }
    }
    None
}

/// First occurrence of `needle` at depth zero.
fn find_top_level(s: &str, needle: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let needle_bytes = needle.as_bytes();
    for (index, _c, top) in top_level_positions(s) {
        if top
            && index + needle_bytes.len() <= bytes.len()
            && &bytes[index..index + needle_bytes.len()] == needle_bytes
        {
            return Some(index);
        }
    }
    None
}

/// Parse one canonical `func.func` header line.
fn parse_func_header(line: &str) -> Option<FuncInfo> {
    let rest = line.strip_prefix("func.func ")?;

    let (is_private, rest) = match rest.strip_prefix("private ") {
        Some(rest) => (true, rest),
        None => (false, rest.strip_prefix("public ").unwrap_or(rest)),
    };
    let rest = rest.strip_prefix("nested ").unwrap_or(rest);

    let rest = rest.strip_prefix('@')?;
    let (name, rest) = parse_symbol_name(rest)?;

    let open = rest.find('(')?;
    if !rest[..open].trim().is_empty() {
        return None;
    }
    let close = find_matching(rest, open)?;
    let params = parse_params(&rest[open + 1..close]);
    let mut rest = rest[close + 1..].trim();

    // Definitions end with the body's opening brace.
    let is_declaration = if let Some(stripped) = rest.strip_suffix('{') {
        rest = stripped.trim_end();
        false
    } else {
        true
    };

    let mut results = Vec::new();
    if let Some(after_arrow) = rest.strip_prefix("->") {
        let after_arrow = after_arrow.trim_start();
        if after_arrow.starts_with('(') {
            let close = find_matching(after_arrow, 0)?;
            results = split_top_level(&after_arrow[1..close], ',')
                .into_iter()
                .map(|ty| ty.trim().to_string())
                .filter(|ty| !ty.is_empty())
                .collect();
            rest = after_arrow[close + 1..].trim();
        } else {
            let end = find_top_level(after_arrow, " attributes").unwrap_or(after_arrow.len());
            results = vec![after_arrow[..end].trim().to_string()];
            rest = after_arrow[end..].trim();
        }
    }

    let mut attrs = Vec::new();
    if let Some(after_kw) = rest.strip_prefix("attributes") {
        let after_kw = after_kw.trim_start();
        if after_kw.starts_with('{') {
            let close = find_matching(after_kw, 0)?;
            attrs = parse_attr_dict(&after_kw[..=close]);
        }
    }

    Some(FuncInfo { name, is_private, is_declaration, params, results, attrs })
}

/// Parse a symbol name, bare or quoted, returning the name and the rest.
fn parse_symbol_name(s: &str) -> Option<(String, &str)> {
    if let Some(quoted) = s.strip_prefix('"') {
        let end = quoted.find('"')?;
        return Some((quoted[..end].to_string(), &quoted[end + 1..]));
    }
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.' | '-')))
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some((s[..end].to_string(), &s[end..]))
}

/// Parse the parameter list of a function header. Handles both the
/// definition form (`%arg0: type {attrs}`) and the declaration form
/// (`type {attrs}`).
fn parse_params(list: &str) -> Vec<ParamInfo> {
    let list = list.trim();
    if list.is_empty() {
        return Vec::new();
    }
    split_top_level(list, ',')
        .into_iter()
        .map(|param| {
            let mut param = param.trim();
            if param.starts_with('%') {
                if let Some(colon) = find_top_level(param, ":") {
                    param = param[colon + 1..].trim_start();
                }
            }
            // A depth-zero `{` starts the argument attribute dictionary;
            // braces inside the type itself are always nested in `<>`.
            let (ty, attrs) = match find_top_level(param, "{") {
                Some(brace) => {
                    let dict = &param[brace..];
                    (param[..brace].trim().to_string(), parse_attr_dict(dict))
                }
                None => (param.trim().to_string(), Vec::new()),
            };
            ParamInfo { ty, attrs }
        })
        .collect()
}

/// Parse an attribute dictionary `{key = value, ...}` (braces included).
pub fn parse_attr_dict(dict: &str) -> Vec<(String, ScannedAttr)> {
    let dict = dict.trim();
    let Some(inner) = dict.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')) else {
        return Vec::new();
    };
    let inner = inner.trim();
    if inner.is_empty() {
        return Vec::new();
    }

    split_top_level(inner, ',')
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.trim();
            match find_top_level(entry, "=") {
                Some(eq) => {
                    let key = entry[..eq].trim().trim_matches('"').to_string();
                    let value = parse_attr_value(entry[eq + 1..].trim());
                    Some((key, value))
                }
                // Unit attribute.
                None => Some((entry.trim_matches('"').to_string(), ScannedAttr::Other(String::new()))),
            }
        })
        .collect()
}

fn parse_attr_value(value: &str) -> ScannedAttr {
    if let Some(rest) = value.strip_prefix('"') {
        if let Some(end) = rest.find('"') {
            return ScannedAttr::Str(rest[..end].to_string());
        }
    }
    if let Some(rest) = value.strip_prefix('@') {
        if let Some((name, _)) = parse_symbol_name(rest) {
            return ScannedAttr::Symbol(name);
        }
    }
    if value.starts_with('{') {
        return ScannedAttr::Dict(parse_attr_dict(value));
    }
    if let Some(colon) = find_top_level(value, ":") {
        let (literal, ty) = (value[..colon].trim(), value[colon + 1..].trim());
        if let Ok(int) = literal.parse::<i64>() {
            return ScannedAttr::Int(int, ty.to_string());
        }
        if let Ok(float) = literal.parse::<f64>() {
            return ScannedAttr::Float(float, ty.to_string());
        }
    }
    match value {
        "true" => ScannedAttr::Int(1, "i1".to_string()),
        "false" => ScannedAttr::Int(0, "i1".to_string()),
        other => ScannedAttr::Other(other.to_string()),
    }
}
