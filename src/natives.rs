use std::time::{SystemTime, UNIX_EPOCH};

use super::table::Interner;
use super::value::{Arity, Native, Value};

/// `clock()` — seconds since the Unix epoch, as a float. Used by Lox
/// programs for crude timing; precision beyond a millisecond isn't
/// guaranteed by any host.
fn clock(_args: &[Value], _interner: &mut Interner) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "system clock is before the Unix epoch".to_string())?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

/// `tostring(value)` — the value's `Display` rendering, interned so the
/// result participates in the same string pool as source-literal
/// strings.
fn tostring(args: &[Value], interner: &mut Interner) -> Result<Value, String> {
    let rendered = args[0].to_string();
    Ok(Value::from(interner.intern(&rendered)))
}

/// `assert(value)` — fails the call (and therefore the running program)
/// unless `value` is truthy.
fn assert(args: &[Value], _interner: &mut Interner) -> Result<Value, String> {
    if args[0].is_falsey() {
        Err("assertion failed".to_string())
    } else {
        Ok(Value::Nil)
    }
}

/// `printf(format, ...)` — prints `format` to stdout with each `{}`
/// placeholder replaced, in order, by the `Display` rendering of the
/// remaining arguments. Extra arguments beyond the placeholder count
/// are ignored; a placeholder with no matching argument is left as-is.
fn printf(args: &[Value], _interner: &mut Interner) -> Result<Value, String> {
    let format = match args.first() {
        Some(value) => value.to_string(),
        None => return Err("printf requires a format string".to_string()),
    };
    let mut rest = args[1..].iter();
    let mut output = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'}') {
            chars.next();
            match rest.next() {
                Some(value) => output += &value.to_string(),
                None => output.push_str("{}"),
            }
        } else {
            output.push(c);
        }
    }
    println!("{}", output);
    Ok(Value::Nil)
}

/// `dump(...)` — a debugging aid that prints every argument's type
/// alongside its rendering, one per line.
fn dump(args: &[Value], _interner: &mut Interner) -> Result<Value, String> {
    for value in args {
        println!("{}: {}", value.type_name(), value);
    }
    Ok(Value::Nil)
}

/// The complete set of globals the VM seeds before running any program.
pub fn native_registry() -> Vec<Native> {
    vec![
        Native { name: "clock", arity: Arity::Fixed(0), func: clock },
        Native { name: "tostring", arity: Arity::Fixed(1), func: tostring },
        Native { name: "assert", arity: Arity::Fixed(1), func: assert },
        Native { name: "printf", arity: Arity::Variadic, func: printf },
        Native { name: "dump", arity: Arity::Variadic, func: dump },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_returns_a_nonnegative_number() {
        let mut interner = Interner::new();
        let result = clock(&[], &mut interner).unwrap();
        assert!(matches!(result, Value::Number(n) if n >= 0.0));
    }

    #[test]
    fn tostring_renders_numbers_and_interns_the_result() {
        let mut interner = Interner::new();
        let result = tostring(&[Value::Number(3.5)], &mut interner).unwrap();
        assert_eq!(result.to_string(), "3.5");
    }

    #[test]
    fn assert_passes_on_truthy_value() {
        let mut interner = Interner::new();
        assert!(assert(&[Value::Bool(true)], &mut interner).is_ok());
    }

    #[test]
    fn assert_fails_on_falsey_value() {
        let mut interner = Interner::new();
        assert!(assert(&[Value::Nil], &mut interner).is_err());
    }

    #[test]
    fn printf_substitutes_placeholders_in_order() {
        let mut interner = Interner::new();
        let a = Value::from(interner.intern("world"));
        let result = printf(&[Value::from(interner.intern("hello {}")), a], &mut interner);
        assert!(result.is_ok());
    }

    #[test]
    fn registry_has_exactly_the_expected_natives() {
        let names: Vec<&str> = native_registry().iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["clock", "tostring", "assert", "printf", "dump"]);
    }
}
