use uuid::Uuid;

pub fn request_id() -> String {
    format!("vreq-{}", Uuid::new_v4().simple())
}
