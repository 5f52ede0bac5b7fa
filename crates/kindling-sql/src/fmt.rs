/// Destination buffer for SQL rendering.
pub(crate) struct Formatter {
    pub dst: String,
}

macro_rules! fmt {
    ($f:expr, $( $fragments:expr )*) => {{
        $(
            $fragments.to_sql($f);
        )*
    }};
}

pub(crate) trait ToSql {
    fn to_sql(self, f: &mut Formatter);
}

impl ToSql for &str {
    fn to_sql(self, f: &mut Formatter) {
        f.dst.push_str(self);
    }
}

impl ToSql for String {
    fn to_sql(self, f: &mut Formatter) {
        f.dst.push_str(&self);
    }
}

impl ToSql for &String {
    fn to_sql(self, f: &mut Formatter) {
        f.dst.push_str(self);
    }
}

impl<T: ToSql> ToSql for Option<T> {
    fn to_sql(self, f: &mut Formatter) {
        if let Some(inner) = self {
            inner.to_sql(f);
        }
    }
}

macro_rules! fmt_numeric {
    ( $( $ty:ident ),* ) => {
        $(
            impl ToSql for $ty {
                fn to_sql(self, f: &mut Formatter) {
                    use std::fmt::Write;
                    write!(f.dst, "{self}").unwrap();
                }
            }
        )*
    };
}

fmt_numeric!(u32, u64, usize, i64);

/// Renders items from `iter` separated by `sep`.
pub(crate) struct Delimited<I>(pub I, pub &'static str);

impl<I, T> ToSql for Delimited<I>
where
    I: IntoIterator<Item = T>,
    T: ToSql,
{
    fn to_sql(self, f: &mut Formatter) {
        let mut first = true;
        for item in self.0 {
            if !first {
                f.dst.push_str(self.1);
            }
            item.to_sql(f);
            first = false;
        }
    }
}
