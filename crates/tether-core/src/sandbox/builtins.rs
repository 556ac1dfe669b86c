//! The fixed set of pure helper functions visible to scripts.

use crate::output::OutputBuffer;
use mlua::{Function, Lua, MultiValue, Table, Value, Variadic};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering as AtomicOrdering};

/// Names of every builtin installed by [`install`].
pub const BUILTINS: &[&str] = &[
    "print",
    "range",
    "len",
    "min",
    "max",
    "sum",
    "map",
    "filter",
    "any",
    "all",
    "zip",
    "enumerate",
];

/// Install the builtins into `env`; `print` writes to `stdout`.
pub fn install(lua: &Lua, env: &Table, stdout: OutputBuffer) -> mlua::Result<()> {
    env.set(
        "print",
        lua.create_function(move |lua, args: Variadic<Value>| {
            let tostring: Function = lua.globals().get("tostring")?;
            let mut parts = Vec::with_capacity(args.len());
            for arg in args {
                parts.push(tostring.call::<String>(arg)?);
            }
            stdout.push_line(&parts.join("\t"));
            Ok(())
        })?,
    )?;
    env.set("range", lua.create_function(range)?)?;
    env.set("len", lua.create_function(len)?)?;
    env.set(
        "min",
        lua.create_function(|_, args: Variadic<Value>| extreme("min", args, Ordering::Less))?,
    )?;
    env.set(
        "max",
        lua.create_function(|_, args: Variadic<Value>| extreme("max", args, Ordering::Greater))?,
    )?;
    env.set("sum", lua.create_function(sum)?)?;
    env.set("map", lua.create_function(map)?)?;
    env.set("filter", lua.create_function(filter)?)?;
    env.set(
        "any",
        lua.create_function(|_, items: Table| Ok(sequence(&items)?.iter().any(truthy)))?,
    )?;
    env.set(
        "all",
        lua.create_function(|_, items: Table| Ok(sequence(&items)?.iter().all(truthy)))?,
    )?;
    env.set("zip", lua.create_function(zip)?)?;
    env.set("enumerate", lua.create_function(enumerate)?)?;
    Ok(())
}

/// `range(stop)`, `range(start, stop[, step])`: iterator over integers with an
/// exclusive upper bound.
fn range(lua: &Lua, (a, b, step): (i64, Option<i64>, Option<i64>)) -> mlua::Result<Function> {
    let (start, stop) = match b {
        Some(stop) => (a, stop),
        None => (0, a),
    };
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(mlua::Error::runtime("range() step must not be zero"));
    }

    let next = AtomicI64::new(start);
    lua.create_function(move |_, ()| {
        let current = next.load(AtomicOrdering::Relaxed);
        let done = if step > 0 { current >= stop } else { current <= stop };
        if done {
            return Ok(None);
        }
        // Saturate; the bound check above ends iteration either way.
        next.store(current.saturating_add(step), AtomicOrdering::Relaxed);
        Ok(Some(current))
    })
}

/// Characters in a string, or the sequence length of a table.
fn len(_: &Lua, value: Value) -> mlua::Result<i64> {
    let n = match &value {
        Value::String(s) => match s.to_str() {
            Ok(s) => s.chars().count(),
            Err(_) => s.as_bytes().len(),
        },
        Value::Table(t) => t.raw_len(),
        other => {
            return Err(mlua::Error::runtime(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(n as i64)
}

/// Shared body of `min` and `max`: a single table argument is unpacked.
fn extreme(name: &str, args: Variadic<Value>, want: Ordering) -> mlua::Result<Value> {
    let items = match args.as_slice() {
        [Value::Table(t)] => sequence(t)?,
        _ => args.to_vec(),
    };

    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => match compare(&item, &current) {
                Some(ord) if ord == want => item,
                Some(_) => current,
                None => {
                    return Err(mlua::Error::runtime(format!(
                        "{name}() arguments must be all numbers or all strings"
                    )))
                }
            },
        });
    }
    best.ok_or_else(|| mlua::Error::runtime(format!("{name}() arg is an empty sequence")))
}

/// `sum(items[, start])`; integer-valued unless a float is involved.
fn sum(_: &Lua, (items, start): (Table, Option<Value>)) -> mlua::Result<Value> {
    let mut total = start.unwrap_or(Value::Integer(0));
    for item in sequence(&items)? {
        total = match (&total, &item) {
            (Value::Integer(a), Value::Integer(b)) => match a.checked_add(*b) {
                Some(n) => Value::Integer(n),
                None => Value::Number(*a as f64 + *b as f64),
            },
            _ => match (number(&total), number(&item)) {
                (Some(a), Some(b)) => Value::Number(a + b),
                _ => {
                    return Err(mlua::Error::runtime(format!(
                        "unsupported operand type for sum(): '{}'",
                        item.type_name()
                    )))
                }
            },
        };
    }
    Ok(total)
}

/// `map(f, items)`: new table with `f` applied to each element.
fn map(lua: &Lua, (f, items): (Function, Table)) -> mlua::Result<Table> {
    let out = sequence(&items)?
        .into_iter()
        .map(|v| f.call::<Value>(v))
        .collect::<mlua::Result<Vec<_>>>()?;
    lua.create_sequence_from(out)
}

/// `filter(f, items)`: elements for which `f` is truthy; `f = nil` keeps
/// truthy elements.
fn filter(lua: &Lua, (f, items): (Option<Function>, Table)) -> mlua::Result<Table> {
    let mut out = Vec::new();
    for v in sequence(&items)? {
        let keep = match &f {
            Some(f) => truthy(&f.call::<Value>(v.clone())?),
            None => truthy(&v),
        };
        if keep {
            out.push(v);
        }
    }
    lua.create_sequence_from(out)
}

/// `zip(a, b, ...)`: iterator yielding one element of each table per step,
/// stopping at the shortest.
fn zip(lua: &Lua, tables: Variadic<Table>) -> mlua::Result<Function> {
    let columns = tables
        .iter()
        .map(sequence)
        .collect::<mlua::Result<Vec<_>>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    let index = AtomicUsize::new(0);

    lua.create_function(move |_, ()| {
        let i = index.fetch_add(1, AtomicOrdering::Relaxed);
        if i >= rows {
            return Ok(MultiValue::new());
        }
        Ok(columns.iter().map(|c| c[i].clone()).collect::<MultiValue>())
    })
}

/// `enumerate(items)`: iterator yielding 1-based `(index, value)` pairs.
fn enumerate(lua: &Lua, items: Table) -> mlua::Result<Function> {
    let values = sequence(&items)?;
    let index = AtomicUsize::new(0);

    lua.create_function(move |_, ()| {
        let i = index.fetch_add(1, AtomicOrdering::Relaxed);
        match values.get(i) {
            Some(v) => Ok((Some((i + 1) as i64), v.clone())),
            None => Ok((None, Value::Nil)),
        }
    })
}

/// Elements `1..=#t`, holes included as `nil`.
fn sequence(t: &Table) -> mlua::Result<Vec<Value>> {
    (1..=t.raw_len()).map(|i| t.raw_get::<Value>(i)).collect()
}

fn truthy(v: &Value) -> bool {
    !matches!(v, Value::Nil | Value::Boolean(false))
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Integer(i) => Some(*i as f64),
        Value::Number(n) => Some(*n),
        _ => None,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some((*x.as_bytes()).cmp(&*y.as_bytes())),
        _ => number(a)?.partial_cmp(&number(b)?),
    }
}
