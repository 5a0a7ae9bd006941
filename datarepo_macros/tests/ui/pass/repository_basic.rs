use datarepo::{repository, Entity};

#[derive(Entity, Clone, Debug)]
pub struct User {
    #[fetch(id)]
    pub id: Option<i64>,
    pub email: String,
    pub active: bool,
}

#[repository(
    entity = User,
    finders(
        find_by_email(email: String) -> Option,
        #[hints(read_only)]
        find_by_active_true() -> Vec,
        count_by_active(active: bool) -> Count,
    ),
    queries(
        emails() -> Scalars<String> = "select u.email from User u",
        #[modifying(clear_automatically)]
        deactivate(email: String) -> Modifying = "update User u set u.active = false where u.email = :email",
    )
)]
pub mod users_repo {}

fn main() {
    let _repo: Result<users_repo::Repository, _> = users_repo::Repository::new();
}
