use std::net::{Ipv4Addr, SocketAddrV4};

use http::{Response, StatusCode};
use http_body_util::BodyExt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use wharf_http::handler::route_fn;
use wharf_http::protocol::{parse_byte_range, ResponseBody};
use wharf_http::router::Route;
use wharf_http::server::{Server, ServerConfig};
use wharf_io::{Runtime, SocketAddr};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let rt = Runtime::new()?;
    let address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080));
    let server = Server::new(ServerConfig::new(address), rt.pool());

    server.route(
        Route::get("/hello/{name}").unwrap(),
        route_fn(|req| async move {
            let name = req
                .extensions()
                .get::<wharf_http::router::PathParams>()
                .and_then(|params| params.get("name"))
                .unwrap_or("world")
                .to_string();
            Ok(Response::builder().body(ResponseBody::from(format!("Hello, {name}!\n"))).unwrap())
        }),
    );

    server.route(
        Route::post("/echo").unwrap(),
        route_fn(|req| async move {
            let body = req.into_body().collect().await?.to_bytes();
            info!(bytes = body.len(), "echoing request body");
            Ok(Response::builder().body(ResponseBody::from(body)).unwrap())
        }),
    );

    // a fixed 100-byte resource that honours single byte ranges
    server.route(
        Route::get("/resource").unwrap(),
        route_fn(|req| async move {
            let resource = [b'r'; 100];
            let response = match parse_byte_range(req.headers()) {
                Some((start, end)) if end < resource.len() as u64 => Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(http::header::CONTENT_RANGE, format!("bytes {start}-{end}/{}", resource.len()))
                    .body(ResponseBody::from(resource[start as usize..=end as usize].to_vec()))
                    .unwrap(),
                Some(_) => Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(http::header::CONTENT_RANGE, format!("bytes */{}", resource.len()))
                    .body(ResponseBody::empty())
                    .unwrap(),
                None => Response::builder().body(ResponseBody::from(resource.to_vec())).unwrap(),
            };
            Ok(response)
        }),
    );

    rt.block_on(server.run())?;
    Ok(())
}
