use datarepo_macros::Entity;

// `column` needs a value
#[derive(Entity)]
struct Broken {
    #[fetch(id)]
    id: i64,
    #[fetch(column)]
    name: String,
}

fn main() {}
