//! Text level rewrites applied between the lowering stages.
//!
//! The rewrites operate on the canonically printed module and the result is
//! parsed again before machine lowering:
//!
//! * intrinsic declarations carrying `rt.custom_call` become encoding stubs
//!   that marshal their arguments and call the uniform dispatch symbol,
//! * user custom types are substituted with their LLVM level lowering,
//! * `memref.alloc` operations receive the configured minimum alignment.

use std::collections::HashMap;
use std::fmt::Write as _;

use molten_dtype::DType;

use crate::custom_call::{
    ArgTag, AttrValue, CustomCallRegistry, DISPATCH_SYMBOL, MAX_MEMREF_RANK, dtype_tag,
};
use crate::error::{CustomCallSnafu, Result};
use crate::scan::{FuncInfo, scan_module};
use crate::specialize::{insert_into_module, parse_shaped_text};

/// Declared attributes per custom call key, captured at compile time and
/// installed for dispatch at execution time.
pub type CustomCallAttrs = HashMap<String, Vec<(String, AttrValue)>>;

/// Rewrite every bridged intrinsic declaration into an encoding stub.
///
/// Returns the rewritten module text and the declared attribute dictionaries
/// of the bridged intrinsics.
pub fn rewrite_custom_calls(
    module_text: &str,
    registry: &CustomCallRegistry,
) -> Result<(String, CustomCallAttrs)> {
    let mut attrs = CustomCallAttrs::new();
    let mut output = String::with_capacity(module_text.len());
    let mut stub_index = 0usize;
    let mut bridged_any = false;

    for line in module_text.lines() {
        let scanned = scan_module(line);
        let declaration = scanned
            .functions
            .first()
            .filter(|func| func.is_declaration && func.custom_call_key().is_some());

        match declaration {
            Some(func) => {
                let key = func.custom_call_key().unwrap_or_default().to_string();
                if !registry.contains(&key) {
                    return CustomCallSnafu { callee: key, reason: "not registered".to_string() }
                        .fail();
                }
                tracing::debug!(custom_call.name = %key, intrinsic = %func.name, "bridging custom call declaration");
                let stub = generate_intrinsic_stub(func, &key, stub_index)?;
                output.push_str(&stub);
                attrs.insert(key, func.custom_call_attrs());
                stub_index += 1;
                bridged_any = true;
            }
            None => {
                output.push_str(line);
                output.push('\n');
            }
        }
    }

    if bridged_any {
        // Declare the dispatch symbol; it is registered with the execution
        // engine before symbol resolution.
        let dispatch = format!(
            "  func.func private @{DISPATCH_SYMBOL}(!llvm.ptr, !llvm.ptr, i64) -> i1\n"
        );
        output = insert_into_module(&output, &dispatch);
    }

    Ok((output, attrs))
}

/// The encoded IR level kind of one stub parameter.
enum ParamKind<'a> {
    Opaque,
    Scalar(&'a str, ArgTag),
    Memref { rank: usize, dtype: DType },
}

fn classify_param<'a>(func: &FuncInfo, key: &str, ty: &'a str) -> Result<ParamKind<'a>> {
    match ty {
        "!llvm.ptr" => return Ok(ParamKind::Opaque),
        "i32" => return Ok(ParamKind::Scalar("i32", ArgTag::I32)),
        "i64" => return Ok(ParamKind::Scalar("i64", ArgTag::I64)),
        "f32" => return Ok(ParamKind::Scalar("f32", ArgTag::F32)),
        "f64" => return Ok(ParamKind::Scalar("f64", ArgTag::F64)),
        _ => {}
    }

    if let Some(shaped) = parse_shaped_text(ty)
        && shaped.kind == "memref"
        && let Some(dims) = shaped.dims
        && let Some(dtype) = DType::from_ir_name(shaped.element)
        && dims.len() as i64 <= MAX_MEMREF_RANK
    {
        return Ok(ParamKind::Memref { rank: dims.len(), dtype });
    }

    CustomCallSnafu {
        callee: key.to_string(),
        reason: format!("unsupported argument type {ty} in intrinsic '{}'", func.name),
    }
    .fail()
}

/// Generate the encoding stub replacing one intrinsic declaration.
fn generate_intrinsic_stub(func: &FuncInfo, key: &str, stub_index: usize) -> Result<String> {
    let returns_status = match func.results.as_slice() {
        [] => false,
        [ty] if ty == "i1" => true,
        _ => {
            return CustomCallSnafu {
                callee: key.to_string(),
                reason: format!(
                    "intrinsic '{}' must return nothing or i1, got ({})",
                    func.name,
                    func.results.join(", ")
                ),
            }
            .fail();
        }
    };

    let num_args = func.params.len();
    let name_global = format!("__molten_cc_name_{stub_index}");
    let args_array = format!("!llvm.array<{num_args} x struct<(i64, ptr)>>");

    let mut text = String::new();
    let _ = writeln!(
        text,
        "  llvm.mlir.global internal constant @{name_global}(\"{key}\\00\") {{addr_space = 0 : i32}}"
    );

    let params = func
        .params
        .iter()
        .enumerate()
        .map(|(i, param)| format!("%a{i}: {}", param.ty))
        .collect::<Vec<_>>()
        .join(", ");
    let result_suffix = if returns_status { " -> i1".to_string() } else { String::new() };
    let _ = writeln!(text, "  func.func private @{}({params}){result_suffix} {{", func.name);
    let _ = writeln!(text, "    %one = llvm.mlir.constant(1 : i64) : i64");
    if num_args > 0 {
        let _ = writeln!(text, "    %args = llvm.alloca %one x {args_array} : (i64) -> !llvm.ptr");
    } else {
        let _ = writeln!(text, "    %args = llvm.mlir.zero : !llvm.ptr");
    }

    for (i, param) in func.params.iter().enumerate() {
        let kind = classify_param(func, key, &param.ty)?;
        let (tag, value) = match kind {
            ParamKind::Opaque => (ArgTag::Opaque, format!("%a{i}")),
            ParamKind::Scalar(scalar_ty, tag) => {
                let _ = writeln!(
                    text,
                    "    %slot{i} = llvm.alloca %one x {scalar_ty} : (i64) -> !llvm.ptr"
                );
                let _ = writeln!(text, "    llvm.store %a{i}, %slot{i} : {scalar_ty}, !llvm.ptr");
                (tag, format!("%slot{i}"))
            }
            ParamKind::Memref { rank, dtype } => {
                encode_memref(&mut text, i, &param.ty, rank, dtype);
                (ArgTag::Memref, format!("%em{i}"))
            }
        };

        let _ = writeln!(text, "    %tag{i} = llvm.mlir.constant({} : i64) : i64", tag as i64);
        let _ = writeln!(
            text,
            "    %tp{i} = llvm.getelementptr %args[0, {i}, 0] : (!llvm.ptr) -> !llvm.ptr, {args_array}"
        );
        let _ = writeln!(text, "    llvm.store %tag{i}, %tp{i} : i64, !llvm.ptr");
        let _ = writeln!(
            text,
            "    %vp{i} = llvm.getelementptr %args[0, {i}, 1] : (!llvm.ptr) -> !llvm.ptr, {args_array}"
        );
        let _ = writeln!(text, "    llvm.store {value}, %vp{i} : !llvm.ptr, !llvm.ptr");
    }

    let _ = writeln!(text, "    %name = llvm.mlir.addressof @{name_global} : !llvm.ptr");
    let _ = writeln!(text, "    %n = llvm.mlir.constant({num_args} : i64) : i64");
    let _ = writeln!(
        text,
        "    %status = func.call @{DISPATCH_SYMBOL}(%name, %args, %n) : (!llvm.ptr, !llvm.ptr, i64) -> i1"
    );
    if returns_status {
        let _ = writeln!(text, "    return %status : i1");
    } else {
        let _ = writeln!(text, "    return");
    }
    let _ = writeln!(text, "  }}");

    Ok(text)
}

/// Emit the encoding of one memref parameter: the strided descriptor struct
/// plus the `{rank, element type id, descriptor}` header the decoder expects.
fn encode_memref(text: &mut String, i: usize, ty: &str, rank: usize, dtype: DType) {
    let descriptor_ty = if rank == 0 {
        "!llvm.struct<(ptr, ptr, i64)>".to_string()
    } else {
        format!("!llvm.struct<(ptr, ptr, i64, array<{rank} x i64>, array<{rank} x i64>)>")
    };

    // Aligned data pointer.
    let _ = writeln!(
        text,
        "    %api{i} = memref.extract_aligned_pointer_as_index %a{i} : {ty} -> index"
    );
    let _ = writeln!(text, "    %apc{i} = arith.index_cast %api{i} : index to i64");
    let _ = writeln!(text, "    %ap{i} = llvm.inttoptr %apc{i} : i64 to !llvm.ptr");

    // Offset, sizes and strides.
    let mut results = format!("%base{i}, %off{i}");
    let mut result_types = "memref<".to_string() + dtype.ir_name() + ">, index";
    if rank > 0 {
        let _ = write!(results, ", %sz{i}:{rank}, %st{i}:{rank}");
        for _ in 0..2 * rank {
            result_types.push_str(", index");
        }
    }
    let _ = writeln!(
        text,
        "    {results} = memref.extract_strided_metadata %a{i} : {ty} -> {result_types}"
    );

    let _ = writeln!(
        text,
        "    %d{i} = llvm.alloca %one x {descriptor_ty} : (i64) -> !llvm.ptr"
    );

    // Base and aligned pointers; the aligned pointer stands in for both.
    let base = format!("%ap{i}");
    store_gep(text, i, &descriptor_ty, "0", &base, "!llvm.ptr");
    store_gep(text, i, &descriptor_ty, "1", &base, "!llvm.ptr");

    let _ = writeln!(text, "    %offc{i} = arith.index_cast %off{i} : index to i64");
    store_gep(text, i, &descriptor_ty, "2", &format!("%offc{i}"), "i64");

    for dim in 0..rank {
        let _ = writeln!(text, "    %szc{i}_{dim} = arith.index_cast %sz{i}#{dim} : index to i64");
        store_gep(text, i, &descriptor_ty, &format!("3, {dim}"), &format!("%szc{i}_{dim}"), "i64");
        let _ = writeln!(text, "    %stc{i}_{dim} = arith.index_cast %st{i}#{dim} : index to i64");
        store_gep(text, i, &descriptor_ty, &format!("4, {dim}"), &format!("%stc{i}_{dim}"), "i64");
    }
    // EncodedMemref header {rank, element type id, descriptor}.
    let _ = writeln!(
        text,
        "    %em{i} = llvm.alloca %one x !llvm.struct<(i64, ptr, ptr)> : (i64) -> !llvm.ptr"
    );
    let _ = writeln!(text, "    %rk{i} = llvm.mlir.constant({rank} : i64) : i64");
    let _ = writeln!(
        text,
        "    %emf0{i} = llvm.getelementptr %em{i}[0, 0] : (!llvm.ptr) -> !llvm.ptr, !llvm.struct<(i64, ptr, ptr)>"
    );
    let _ = writeln!(text, "    llvm.store %rk{i}, %emf0{i} : i64, !llvm.ptr");
    let _ = writeln!(text, "    %et{i} = llvm.mlir.constant({} : i64) : i64", dtype_tag(dtype));
    let _ = writeln!(text, "    %etp{i} = llvm.inttoptr %et{i} : i64 to !llvm.ptr");
    let _ = writeln!(
        text,
        "    %emf1{i} = llvm.getelementptr %em{i}[0, 1] : (!llvm.ptr) -> !llvm.ptr, !llvm.struct<(i64, ptr, ptr)>"
    );
    let _ = writeln!(text, "    llvm.store %etp{i}, %emf1{i} : !llvm.ptr, !llvm.ptr");
    let _ = writeln!(
        text,
        "    %emf2{i} = llvm.getelementptr %em{i}[0, 2] : (!llvm.ptr) -> !llvm.ptr, !llvm.struct<(i64, ptr, ptr)>"
    );
    let _ = writeln!(text, "    llvm.store %d{i}, %emf2{i} : !llvm.ptr, !llvm.ptr");
}

fn store_gep(
    text: &mut String,
    i: usize,
    descriptor_ty: &str,
    field: &str,
    value: &str,
    value_ty: &str,
) {
    let label = field.replace(", ", "_");
    let _ = writeln!(
        text,
        "    %d{i}f{label} = llvm.getelementptr %d{i}[0, {field}] : (!llvm.ptr) -> !llvm.ptr, {descriptor_ty}"
    );
    let _ = writeln!(text, "    llvm.store {value}, %d{i}f{label} : {value_ty}, !llvm.ptr");
}

/// Substitute user custom types with their LLVM level lowering.
pub fn rewrite_custom_types(module_text: &str, lowerings: &[(String, String)]) -> String {
    let mut text = module_text.to_string();
    for (from, to) in lowerings {
        text = text.replace(from.as_str(), to.as_str());
    }
    text
}

/// Force a minimum alignment on every `memref.alloc` in the module.
pub fn rewrite_alloc_alignment(module_text: &str, alignment: usize) -> String {
    if alignment == 0 {
        return module_text.to_string();
    }

    let mut output = String::with_capacity(module_text.len());
    for line in module_text.lines() {
        output.push_str(&align_alloc_line(line, alignment));
        output.push('\n');
    }
    output
}

fn align_alloc_line(line: &str, alignment: usize) -> String {
    let Some(op_start) = line.find("memref.alloc") else {
        return line.to_string();
    };

    // Raise an existing smaller alignment.
    if let Some(attr_start) = line.find("alignment = ") {
        let value_start = attr_start + "alignment = ".len();
        let value_end = line[value_start..]
            .find(|c: char| !c.is_ascii_digit())
            .map(|end| value_start + end)
            .unwrap_or(line.len());
        if let Ok(existing) = line[value_start..value_end].parse::<usize>() {
            if existing < alignment {
                return format!(
                    "{}{}{}",
                    &line[..value_start],
                    alignment,
                    &line[value_end..]
                );
            }
        }
        return line.to_string();
    }

    // No attribute dictionary: insert one after the operand groups.
    let mut cursor = op_start + "memref.alloc".len();
    let bytes = line.as_bytes();
    if bytes.get(cursor) == Some(&b'a') {
        // memref.alloca
        cursor += 1;
    }
    for open in ['(', '['] {
        if bytes.get(cursor) == Some(&(open as u8)) {
            let mut depth = 0usize;
            for (offset, c) in line[cursor..].char_indices() {
                match c {
                    '(' | '[' => depth += 1,
                    ')' | ']' => {
                        depth -= 1;
                        if depth == 0 {
                            cursor += offset + 1;
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    format!(
        "{} {{alignment = {alignment} : i64}}{}",
        &line[..cursor],
        &line[cursor..]
    )
}

#[cfg(test)]
mod tests {
    use crate::custom_call::CustomCall;

    use super::*;

    fn registry_with(name: &str) -> CustomCallRegistry {
        let mut registry = CustomCallRegistry::new();
        registry.register(CustomCall::bind(name).to(|_| true)).unwrap();
        registry
    }

    #[test]
    fn test_rewrite_replaces_declaration_with_stub() {
        let module = r#"module {
  func.func private @my.runtime.intrinsic(!llvm.ptr) attributes {rt.attrs = {api_version = 1 : i32}, rt.custom_call = "my.runtime.intrinsic"}
  func.func @compute(%arg0: !llvm.ptr) {
    func.call @my.runtime.intrinsic(%arg0) : (!llvm.ptr) -> ()
    return
  }
}
"#;
        let registry = registry_with("my.runtime.intrinsic");
        let (rewritten, attrs) = rewrite_custom_calls(module, &registry).unwrap();

        // The declaration became a definition that encodes and dispatches.
        assert!(!rewritten.contains("rt.custom_call"));
        assert!(rewritten.contains("func.func private @my.runtime.intrinsic(%a0: !llvm.ptr) {"));
        assert!(rewritten.contains("llvm.mlir.global internal constant @__molten_cc_name_0(\"my.runtime.intrinsic\\00\")"));
        assert!(rewritten.contains("func.call @__molten_custom_call(%name, %args, %n)"));
        assert!(rewritten.contains("func.func private @__molten_custom_call(!llvm.ptr, !llvm.ptr, i64) -> i1"));

        // Declared attributes were captured for dispatch.
        assert_eq!(
            attrs.get("my.runtime.intrinsic").unwrap(),
            &vec![("api_version".to_string(), AttrValue::I32(1))]
        );
    }

    #[test]
    fn test_rewrite_requires_registration() {
        let module = r#"module {
  func.func private @f() attributes {rt.custom_call = "unknown.call"}
}
"#;
        let registry = CustomCallRegistry::new();
        let err = rewrite_custom_calls(module, &registry).unwrap_err();
        assert!(err.to_string().contains("unknown.call"));
    }

    #[test]
    fn test_stub_encodes_scalars_and_memrefs() {
        let module = r#"module {
  func.func private @intr(i32, memref<?x?xf32>) -> i1 attributes {rt.custom_call = "intr"}
}
"#;
        let registry = registry_with("intr");
        let (rewritten, _) = rewrite_custom_calls(module, &registry).unwrap();

        assert!(rewritten.contains("%slot0 = llvm.alloca %one x i32"));
        assert!(rewritten.contains("memref.extract_strided_metadata %a1"));
        assert!(rewritten.contains("llvm.struct<(ptr, ptr, i64, array<2 x i64>, array<2 x i64>)>"));
        assert!(rewritten.contains("return %status : i1"));
    }

    #[test]
    fn test_stub_rejects_unsupported_types() {
        let module = r#"module {
  func.func private @intr(vector<4xf32>) attributes {rt.custom_call = "intr"}
}
"#;
        let registry = registry_with("intr");
        let err = rewrite_custom_calls(module, &registry).unwrap_err();
        assert!(err.to_string().contains("unsupported argument type"));
    }

    #[test]
    fn test_custom_type_substitution() {
        let module = "func.func @f(%arg0: !testlib.custom_arg)";
        let lowered = rewrite_custom_types(
            module,
            &[("!testlib.custom_arg".to_string(), "!llvm.ptr".to_string())],
        );
        assert_eq!(lowered, "func.func @f(%arg0: !llvm.ptr)");
    }

    #[test]
    fn test_alloc_alignment_rewrite() {
        let module = "    %0 = memref.alloc(%dim) : memref<?xf32>\n    %1 = memref.alloc() {alignment = 8 : i64} : memref<4xf32>\n    %2 = memref.alloc() {alignment = 64 : i64} : memref<4xf32>\n";
        let rewritten = rewrite_alloc_alignment(module, 16);

        assert!(rewritten.contains("%0 = memref.alloc(%dim) {alignment = 16 : i64} : memref<?xf32>"));
        // Smaller alignment raised, larger left alone.
        assert!(rewritten.contains("%1 = memref.alloc() {alignment = 16 : i64} : memref<4xf32>"));
        assert!(rewritten.contains("%2 = memref.alloc() {alignment = 64 : i64} : memref<4xf32>"));
    }

    #[test]
    fn test_alignment_zero_is_identity() {
        let module = "%0 = memref.alloc() : memref<4xf32>\n";
        assert_eq!(rewrite_alloc_alignment(module, 0), module);
    }
}
