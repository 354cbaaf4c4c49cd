use actix_web::{get, web, HttpResponse, Responder};

use crate::{error::Error, service::Service};

const OPENAPI: &str = include_str!("openapi.yaml");

#[get("/health")]
pub async fn health(service: web::Data<Service>) -> Result<impl Responder, Error> {
    service.ping().await?;

    Ok("OK")
}

#[get("/openapi.yaml")]
pub async fn openapi_yaml() -> impl Responder {
    HttpResponse::Ok()
        .content_type("application/yaml")
        .body(OPENAPI)
}

#[get("/openapi.json")]
pub async fn openapi_json() -> Result<impl Responder, Error> {
    let document: serde_json::Value = serde_yaml::from_str(OPENAPI).map_err(Error::internal)?;

    Ok(HttpResponse::Ok().json(document))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_document_parses() {
        let document: serde_json::Value = serde_yaml::from_str(OPENAPI).unwrap();

        assert_eq!(document["info"]["title"], "relaymq");
        assert!(document["paths"]["/work/take"].is_object());
    }
}
