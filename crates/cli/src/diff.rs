use serde_json::Value as Json;

/// One line per changed leaf, as `path: old -> new`. Paths use `.key` and `[i]`.
pub fn changed_paths(old: &Json, new: &Json) -> Vec<String> {
    fn walk(path: &mut String, a: &Json, b: &Json, out: &mut Vec<String>) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                let mut keys: Vec<&String> = ao.keys().chain(bo.keys().filter(|k| !ao.contains_key(*k))).collect();
                keys.sort();
                for k in keys {
                    let len = path.len();
                    path.push('.');
                    path.push_str(k);
                    match (ao.get(k), bo.get(k)) {
                        (Some(av), Some(bv)) if av != bv => walk(path, av, bv, out),
                        (Some(av), None) => out.push(format!("{}: {} -> <none>", path, av)),
                        (None, Some(bv)) => out.push(format!("{}: <none> -> {}", path, bv)),
                        _ => {}
                    }
                    path.truncate(len);
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                for i in 0..aa.len().max(bb.len()) {
                    let len = path.len();
                    path.push_str(&format!("[{}]", i));
                    match (aa.get(i), bb.get(i)) {
                        (Some(av), Some(bv)) if av != bv => walk(path, av, bv, out),
                        (Some(av), None) => out.push(format!("{}: {} -> <none>", path, av)),
                        (None, Some(bv)) => out.push(format!("{}: <none> -> {}", path, bv)),
                        _ => {}
                    }
                    path.truncate(len);
                }
            }
            (av, bv) => {
                if av != bv {
                    out.push(format!("{}: {} -> {}", path, av, bv));
                }
            }
        }
    }
    let mut out = Vec::new();
    walk(&mut String::new(), old, new, &mut out);
    out
}
