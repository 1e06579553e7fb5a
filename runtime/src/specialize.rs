//! Shape and value specialization of the entry point.
//!
//! Specialization synthesizes a new entry function whose parameters carry the
//! concrete operand shapes. The shim casts each refined operand back to the
//! original parameter type (a static-to-dynamic cast is always legal),
//! materializes value-constrained operands as constants, and calls the
//! original entry; inlining and canonicalization in the machine lowering
//! stage then propagate the refinements into the body. Parameter count and
//! order are unchanged, only shape, element type and value refinements occur.

use std::fmt::Write as _;

use molten_dtype::DType;

use crate::arguments::{Argument, MemrefDesc};
use crate::error::{
    ArityMismatchSnafu, RankMismatchSnafu, Result, ShapeMismatchSnafu, SpecializeSnafu,
};
use crate::scan::{Constraint, FuncInfo};

/// Shaped IR type split into its textual parts.
pub(crate) struct ShapedText<'a> {
    /// `memref` or `tensor`.
    pub(crate) kind: &'a str,
    /// `None` for unranked (`*x`) shapes.
    pub(crate) dims: Option<Vec<Option<i64>>>,
    pub(crate) element: &'a str,
}

/// Split `memref<...>`/`tensor<...>` into kind, dims and element spelling.
/// Types with layout or memory space annotations are not specializable.
pub(crate) fn parse_shaped_text(ty: &str) -> Option<ShapedText<'_>> {
    let (kind, body) = if let Some(body) = ty.strip_prefix("memref<") {
        ("memref", body.strip_suffix('>')?)
    } else if let Some(body) = ty.strip_prefix("tensor<") {
        ("tensor", body.strip_suffix('>')?)
    } else {
        return None;
    };

    if crate::scan::split_top_level(body, ',').len() != 1 {
        return None;
    }

    if let Some(element) = body.strip_prefix("*x") {
        return Some(ShapedText { kind, dims: None, element });
    }

    let mut parts: Vec<&str> = body.split('x').collect();
    let element = parts.pop()?;
    let mut dims = Vec::with_capacity(parts.len());
    for part in parts {
        if part == "?" {
            dims.push(None);
        } else {
            dims.push(Some(part.parse::<i64>().ok()?));
        }
    }
    Some(ShapedText { kind, dims: Some(dims), element })
}

fn shaped_type_text(kind: &str, sizes: &[i64], element: &str) -> String {
    let mut text = format!("{kind}<");
    for size in sizes {
        let _ = write!(text, "{size}x");
    }
    let _ = write!(text, "{element}>");
    text
}

/// Check a memref operand against the textual dims of the parameter type.
fn check_operand(index: usize, desc: &MemrefDesc, shaped: &ShapedText<'_>) -> Result<()> {
    let Some(dims) = &shaped.dims else {
        return Ok(());
    };
    if desc.rank() != dims.len() {
        return RankMismatchSnafu { index, actual: desc.rank(), expected: dims.len() }.fail();
    }
    for (dim, (actual, expected)) in desc.sizes().iter().zip(dims).enumerate() {
        if let Some(expected) = expected
            && actual != expected
        {
            return ShapeMismatchSnafu { index, dim, actual: *actual, expected: *expected }.fail();
        }
    }
    Ok(())
}

/// Read the integer elements of a small operand for value specialization.
fn read_int_values(index: usize, desc: &MemrefDesc) -> Result<Vec<i64>> {
    let count = desc.sizes().iter().product::<i64>().max(if desc.rank() == 0 { 1 } else { 0 });
    let mut values = Vec::with_capacity(count as usize);

    if desc.data().is_null() {
        return SpecializeSnafu {
            index,
            reason: "value specialization requires operand data".to_string(),
        }
        .fail();
    }

    // Rank 0 and rank 1 operands cover the constraint use cases (scalars and
    // permutation vectors).
    match desc.rank() {
        0 => {
            let value = unsafe { read_int(desc.dtype(), desc.data(), desc.offset()) };
            values.push(value.ok_or(()).or_else(|()| unsupported_dtype(index, desc.dtype()))?);
        }
        1 => {
            let stride = desc.stride(0);
            for element in 0..desc.size(0) {
                let offset = desc.offset() + element * stride;
                let value = unsafe { read_int(desc.dtype(), desc.data(), offset) };
                values
                    .push(value.ok_or(()).or_else(|()| unsupported_dtype(index, desc.dtype()))?);
            }
        }
        rank => {
            return SpecializeSnafu {
                index,
                reason: format!("value specialization is limited to rank 0 and 1, got rank {rank}"),
            }
            .fail();
        }
    }
    Ok(values)
}

fn unsupported_dtype(index: usize, dtype: DType) -> Result<i64> {
    SpecializeSnafu { index, reason: format!("value specialization does not support {dtype}") }
        .fail()
}

unsafe fn read_int(dtype: DType, data: *mut (), offset: i64) -> Option<i64> {
    let value = match dtype {
        DType::Int32 => unsafe { (data as *const i32).offset(offset as isize).read() as i64 },
        DType::Int64 => unsafe { (data as *const i64).offset(offset as isize).read() },
        _ => return None,
    };
    Some(value)
}

/// Build the specialized entry function for the given operands.
///
/// Returns the shim function text; the caller inserts it into the module and
/// compiles with the shim as the entry point.
pub fn build_specialization_shim(
    entry: &FuncInfo,
    shim_name: &str,
    operands: &[Argument],
) -> Result<String> {
    if operands.len() != entry.params.len() {
        return ArityMismatchSnafu { actual: operands.len(), expected: entry.params.len() }.fail();
    }

    let mut params = Vec::with_capacity(operands.len());
    let mut globals = String::new();
    let mut body = String::new();
    let mut call_operands = Vec::with_capacity(operands.len());

    for (index, (param, operand)) in entry.params.iter().zip(operands).enumerate() {
        let constraint = param.constraint();
        let arg_name = format!("%arg{index}");

        let Argument::Memref(desc) = operand else {
            // Non-memref operands pass through without refinement; they
            // cannot satisfy a specialization constraint.
            if constraint.is_some() {
                return SpecializeSnafu {
                    index,
                    reason: "constrained parameter requires a memref operand".to_string(),
                }
                .fail();
            }
            params.push(format!("{arg_name}: {}", param.ty));
            call_operands.push((arg_name, param.ty.clone()));
            continue;
        };

        let Some(shaped) = parse_shaped_text(&param.ty) else {
            if constraint.is_some() {
                return SpecializeSnafu {
                    index,
                    reason: format!("type {} is not specializable", param.ty),
                }
                .fail();
            }
            params.push(format!("{arg_name}: {}", param.ty));
            call_operands.push((arg_name, param.ty.clone()));
            continue;
        };

        check_operand(index, desc, &shaped)?;
        if shaped.element != desc.dtype().ir_name() {
            return SpecializeSnafu {
                index,
                reason: format!(
                    "operand element type {} does not match {}",
                    desc.dtype(),
                    shaped.element
                ),
            }
            .fail();
        }

        let specialized_ty = shaped_type_text(shaped.kind, desc.sizes(), shaped.element);
        params.push(format!("{arg_name}: {specialized_ty}"));

        if constraint == Some(Constraint::Value) {
            let values = read_int_values(index, desc)?;
            let literal = if desc.rank() == 0 {
                format!("dense<{}>", values[0])
            } else {
                let joined =
                    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                format!("dense<[{joined}]>")
            };
            if shaped.kind == "tensor" {
                let _ = writeln!(
                    body,
                    "    %cst{index} = arith.constant {literal} : {specialized_ty}"
                );
            } else {
                // Memref constants live in module scope.
                let global = format!("__{shim_name}_cst{index}");
                let _ = writeln!(
                    globals,
                    "  memref.global \"private\" constant @{global} : {specialized_ty} = {literal}"
                );
                let _ = writeln!(
                    body,
                    "    %cst{index} = memref.get_global @{global} : {specialized_ty}"
                );
            }
            if param.ty == specialized_ty {
                call_operands.push((format!("%cst{index}"), param.ty.clone()));
            } else {
                let _ = writeln!(
                    body,
                    "    %cast{index} = {}.cast %cst{index} : {specialized_ty} to {}",
                    shaped.kind, param.ty
                );
                call_operands.push((format!("%cast{index}"), param.ty.clone()));
            }
        } else if param.ty == specialized_ty {
            call_operands.push((arg_name, param.ty.clone()));
        } else {
            let _ = writeln!(
                body,
                "    %cast{index} = {}.cast {arg_name} : {specialized_ty} to {}",
                shaped.kind, param.ty
            );
            call_operands.push((format!("%cast{index}"), param.ty.clone()));
        }
    }

    let operand_names =
        call_operands.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>().join(", ");
    let operand_types =
        call_operands.iter().map(|(_, ty)| ty.as_str()).collect::<Vec<_>>().join(", ");
    let result_types = entry.results.join(", ");

    let mut shim = format!("  func.func @{shim_name}({})", params.join(", "));
    match entry.results.len() {
        0 => {
            let _ = writeln!(shim, " {{");
            shim.push_str(&body);
            let _ = writeln!(
                shim,
                "    func.call @{}({operand_names}) : ({operand_types}) -> ()",
                entry.name
            );
            let _ = writeln!(shim, "    return");
        }
        1 => {
            let _ = writeln!(shim, " -> {result_types} {{");
            shim.push_str(&body);
            let _ = writeln!(
                shim,
                "    %ret = func.call @{}({operand_names}) : ({operand_types}) -> {result_types}",
                entry.name
            );
            let _ = writeln!(shim, "    return %ret : {result_types}");
        }
        n => {
            let _ = writeln!(shim, " -> ({result_types}) {{");
            shim.push_str(&body);
            let _ = writeln!(
                shim,
                "    %ret:{n} = func.call @{}({operand_names}) : ({operand_types}) -> ({result_types})",
                entry.name
            );
            let projected =
                (0..n).map(|i| format!("%ret#{i}")).collect::<Vec<_>>().join(", ");
            let _ = writeln!(shim, "    return {projected} : {result_types}");
        }
    }
    shim.push_str("  }\n");
    globals.push_str(&shim);
    Ok(globals)
}

/// Insert a function into the module text, before the closing brace of the
/// top level `module` operation.
pub fn insert_into_module(module_text: &str, func_text: &str) -> String {
    match module_text.rfind('}') {
        Some(close) => {
            let mut text = String::with_capacity(module_text.len() + func_text.len() + 1);
            text.push_str(&module_text[..close]);
            text.push_str(func_text);
            text.push_str(&module_text[close..]);
            text
        }
        None => {
            // Bare function list without a `module` wrapper.
            let mut text = module_text.to_string();
            text.push('\n');
            text.push_str(func_text);
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use molten_dtype::DType;

    use crate::error::Error;
    use crate::scan::scan_module;

    use super::*;

    fn entry_with_constraint() -> FuncInfo {
        let module = r#"  func.func @compute(%arg0: tensor<?x?xf32>, %arg1: tensor<2xi32> {rt.specialize = "value"}) -> tensor<?x?xf32> {"#;
        scan_module(module).functions.remove(0)
    }

    #[test]
    fn test_shape_and_value_specialization_shim() {
        let entry = entry_with_constraint();

        let mut input = [1.0f32, 2.0, 3.0, 4.0];
        let mut perm = [1i32, 0];
        let operands = vec![
            Argument::from(MemrefDesc::contiguous(
                DType::Float32,
                input.as_mut_ptr() as *mut (),
                &[2, 2],
            )),
            Argument::from(MemrefDesc::contiguous(
                DType::Int32,
                perm.as_mut_ptr() as *mut (),
                &[2],
            )),
        ];

        let shim = build_specialization_shim(&entry, "__specialized", &operands).unwrap();

        assert!(shim.contains("func.func @__specialized(%arg0: tensor<2x2xf32>, %arg1: tensor<2xi32>)"));
        assert!(shim.contains("%cast0 = tensor.cast %arg0 : tensor<2x2xf32> to tensor<?x?xf32>"));
        assert!(shim.contains("%cst1 = arith.constant dense<[1, 0]> : tensor<2xi32>"));
        // The constant replaces the operand in the call.
        assert!(shim.contains("func.call @compute(%cast0, %cst1)"));
        assert!(shim.contains("return %ret : tensor<?x?xf32>"));
    }

    #[test]
    fn test_static_operand_passes_through() {
        let module = "  func.func @f(%arg0: memref<4xf32>) {";
        let entry = scan_module(module).functions.remove(0);
        let operands = vec![Argument::from(MemrefDesc::contiguous(
            DType::Float32,
            std::ptr::null_mut(),
            &[4],
        ))];

        let shim = build_specialization_shim(&entry, "__spec", &operands).unwrap();
        assert!(shim.contains("func.call @f(%arg0)"));
        assert!(!shim.contains("cast"));
    }

    #[test]
    fn test_memref_value_specialization_uses_global() {
        let module = r#"  func.func @transpose(%arg0: memref<?x?xf32>, %arg1: memref<?x?xf32>, %arg2: memref<2xi32> {rt.specialize = "value"}) {"#;
        let entry = scan_module(module).functions.remove(0);

        let mut input = [0.0f32; 4];
        let mut output = [0.0f32; 4];
        let mut perm = [1i32, 0];
        let operands = vec![
            Argument::from(MemrefDesc::contiguous(
                DType::Float32,
                input.as_mut_ptr() as *mut (),
                &[2, 2],
            )),
            Argument::from(MemrefDesc::contiguous(
                DType::Float32,
                output.as_mut_ptr() as *mut (),
                &[2, 2],
            )),
            Argument::from(MemrefDesc::contiguous(
                DType::Int32,
                perm.as_mut_ptr() as *mut (),
                &[2],
            )),
        ];

        let shim = build_specialization_shim(&entry, "__spec", &operands).unwrap();
        assert!(shim.contains(
            "memref.global \"private\" constant @__spec_cst2 : memref<2xi32> = dense<[1, 0]>"
        ));
        assert!(shim.contains("%cst2 = memref.get_global @__spec_cst2 : memref<2xi32>"));
        assert!(shim.contains("func.call @transpose(%cast0, %cast1, %cst2)"));
    }

    #[test]
    fn test_specialization_verifies_operands() {
        let entry = entry_with_constraint();

        // Rank mismatch on the first operand.
        let operands = vec![
            Argument::from(MemrefDesc::contiguous(DType::Float32, std::ptr::null_mut(), &[4])),
            Argument::from(MemrefDesc::contiguous(DType::Int32, std::ptr::null_mut(), &[2])),
        ];
        let err = build_specialization_shim(&entry, "__spec", &operands).unwrap_err();
        assert!(matches!(err, Error::RankMismatch { index: 0, .. }));

        // Static dimension mismatch on the permutation.
        let mut input = [0.0f32; 4];
        let mut perm = [0i32; 3];
        let operands = vec![
            Argument::from(MemrefDesc::contiguous(
                DType::Float32,
                input.as_mut_ptr() as *mut (),
                &[2, 2],
            )),
            Argument::from(MemrefDesc::contiguous(
                DType::Int32,
                perm.as_mut_ptr() as *mut (),
                &[3],
            )),
        ];
        let err = build_specialization_shim(&entry, "__spec", &operands).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { index: 1, .. }));

        // Wrong arity.
        let err = build_specialization_shim(&entry, "__spec", &[]).unwrap_err();
        assert!(matches!(err, Error::ArityMismatch { actual: 0, expected: 2 }));
    }

    #[test]
    fn test_insert_into_module() {
        let module = "module {\n  func.func @f() {\n    return\n  }\n}\n";
        let inserted = insert_into_module(module, "  func.func @g() {\n    return\n  }\n");
        assert!(inserted.contains("@g"));
        // The inserted function sits inside the module body.
        let module_close = inserted.rfind('}').unwrap();
        let g_position = inserted.find("@g").unwrap();
        assert!(g_position < module_close);
    }
}
